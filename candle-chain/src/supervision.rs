//! The supervision attached to one training minibatch.

use crate::graph::Graph;
use candle::{bail, Result};
use std::sync::Arc;

/// Constraining graphs and batch shape for one minibatch.
///
/// The network output for the minibatch has `num_sequences * frames_per_sequence` rows,
/// interleaved by sequence: row `t * num_sequences + s` holds frame `t` of sequence `s`.
#[derive(Debug, Clone)]
pub struct Supervision {
    weight: f64,
    frames_per_sequence: usize,
    graphs: Vec<Arc<Graph>>,
}

impl Supervision {
    /// Creates a supervision with one numerator graph per sequence.
    pub fn new(weight: f64, frames_per_sequence: usize, graphs: Vec<Arc<Graph>>) -> Result<Self> {
        if graphs.is_empty() {
            bail!("supervision has no sequences")
        }
        if frames_per_sequence == 0 {
            bail!("supervision has no frames")
        }
        check_weight(weight)?;
        for (s, graph) in graphs.iter().enumerate() {
            if let Err(err) = graph.check_connected() {
                bail!("numerator graph of sequence {s} is malformed: {err}")
            }
        }
        Ok(Self {
            weight,
            frames_per_sequence,
            graphs,
        })
    }

    /// Creates a supervision where all `num_sequences` sequences share the same graph.
    pub fn replicated(
        weight: f64,
        num_sequences: usize,
        frames_per_sequence: usize,
        graph: Arc<Graph>,
    ) -> Result<Self> {
        Self::new(weight, frames_per_sequence, vec![graph; num_sequences])
    }

    /// Same graphs and shape with a different weight.
    pub fn with_weight(&self, weight: f64) -> Result<Self> {
        check_weight(weight)?;
        Ok(Self {
            weight,
            ..self.clone()
        })
    }

    /// Per-example weight; scales the objective and every derivative.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn num_sequences(&self) -> usize {
        self.graphs.len()
    }

    pub fn frames_per_sequence(&self) -> usize {
        self.frames_per_sequence
    }

    pub fn graph(&self, sequence: usize) -> &Graph {
        &self.graphs[sequence]
    }

    pub fn graphs(&self) -> &[Arc<Graph>] {
        &self.graphs
    }

    /// Total number of frame rows the network output must have.
    pub fn num_rows(&self) -> usize {
        self.num_sequences() * self.frames_per_sequence
    }

    /// The normalizer reported alongside the objective: weighted frame count.
    pub fn frame_weight(&self) -> f64 {
        self.weight * self.num_sequences() as f64 * self.frames_per_sequence as f64
    }
}

fn check_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        bail!("invalid supervision weight {weight}")
    }
    Ok(())
}

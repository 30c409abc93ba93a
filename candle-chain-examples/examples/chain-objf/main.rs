//! Chain objective on a synthetic minibatch
//!
//! Builds a random denominator graph and one left-to-right supervision graph per sequence,
//! draws a random network output and runs the objective and its derivatives once.
//!
//! ```bash
//! cargo run --example chain-objf --release -- --num-sequences 8 --frames-per-sequence 150
//!
//! # Load the denominator graph from disk, options from a JSON file
//! cargo run --example chain-objf --release -- --den-graph den.fst --config chain.json
//!
//! # Profile with chrome tracing, on CPU
//! cargo run --example chain-objf --release -- --cpu --tracing
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_chain::{
    compute_chain_objf_and_deriv, ChainTrainingOptions, DenominatorGraph, Graph, Supervision,
    Transition,
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Chain objective on a random minibatch")]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// The seed used for graphs and outputs.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    #[arg(long, default_value_t = 4)]
    num_sequences: usize,

    #[arg(long, default_value_t = 50)]
    frames_per_sequence: usize,

    #[arg(long, default_value_t = 64)]
    num_pdfs: usize,

    /// States of the random denominator graph.
    #[arg(long, default_value_t = 200)]
    num_states: usize,

    /// Read the denominator graph from this file instead of generating one.
    #[arg(long)]
    den_graph: Option<PathBuf>,

    /// Write the denominator graph to this file (`.json` for the text format).
    #[arg(long)]
    save_graph: Option<PathBuf>,

    /// JSON file with training options; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    l2_regularize: Option<f64>,

    #[arg(long)]
    leaky_hmm_coefficient: Option<f64>,

    #[arg(long)]
    verbose: Option<u32>,

    /// Also feed a random cross-entropy output and request its derivative.
    #[arg(long)]
    xent: bool,

    /// Run in f64 rather than f32.
    #[arg(long)]
    f64: bool,
}

impl Args {
    fn options(&self) -> Result<ChainTrainingOptions> {
        let mut opts = match &self.config {
            Some(path) => ChainTrainingOptions::from_json(&std::fs::read_to_string(path)?)?,
            None => ChainTrainingOptions::default(),
        };
        if let Some(v) = self.l2_regularize {
            opts.l2_regularize = v;
        }
        if let Some(v) = self.leaky_hmm_coefficient {
            opts.leaky_hmm_coefficient = v;
        }
        if let Some(v) = self.verbose {
            opts.verbose = v;
        }
        opts.validate()?;
        Ok(opts)
    }
}

/// Sparse random topology with a self-loop and a successor per state, so that every state is
/// reachable and the graph never dead-ends.
fn random_den_graph(rng: &mut StdRng, num_states: usize, num_pdfs: usize) -> Result<Graph> {
    let n = num_states as u32;
    let mut transitions = Vec::new();
    for s in 0..n {
        let mut dsts = vec![s, (s + 1) % n];
        for _ in 0..rng.random_range(0..4) {
            dsts.push(rng.random_range(0..n));
        }
        let weights: Vec<f32> = dsts.iter().map(|_| rng.random_range(0.05f32..1.0)).collect();
        let tot: f32 = weights.iter().sum();
        for (dst, w) in dsts.into_iter().zip(weights) {
            let pdf_id = rng.random_range(0..num_pdfs as u32);
            transitions.push(Transition::new(s, dst, pdf_id, (w / tot).ln()));
        }
    }
    let finals: Vec<(u32, f32)> = (0..n).map(|s| (s, 0.0)).collect();
    Ok(Graph::new(num_states, &[(0, 0.0)], &finals, transitions)?)
}

/// Left-to-right graph over `num_phones` random pdf-ids, each held for one or more frames.
fn random_num_graph(rng: &mut StdRng, num_phones: usize, num_pdfs: usize) -> Result<Graph> {
    let mut transitions = Vec::with_capacity(2 * num_phones);
    for i in 0..num_phones as u32 {
        let pdf_id = rng.random_range(0..num_pdfs as u32);
        transitions.push(Transition::new(i, i + 1, pdf_id, 0.0));
        transitions.push(Transition::new(i + 1, i + 1, pdf_id, 0.0));
    }
    Ok(Graph::new(
        num_phones + 1,
        &[(0, 0.0)],
        &[(num_phones as u32, 0.0)],
        transitions,
    )?)
}

fn random_output(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.random_range(-2f32..2.0))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = candle_chain_examples::setup_tracing(args.tracing, args.debug);

    let opts = args.options()?;
    println!("{}", serde_json::to_string(&opts)?);
    let device = candle_chain_examples::device(args.cpu)?;
    let dtype = if args.f64 { DType::F64 } else { DType::F32 };
    let mut rng = StdRng::seed_from_u64(args.seed);

    let graph = match &args.den_graph {
        Some(path) => Graph::load(path)?,
        None => random_den_graph(&mut rng, args.num_states, args.num_pdfs)?,
    };
    if let Some(path) = &args.save_graph {
        graph.save(path)?;
        println!("denominator graph written to {path:?}");
    }
    let start = std::time::Instant::now();
    let den_graph = DenominatorGraph::from_start_state(&graph, 0, args.num_pdfs, &device)?;
    println!(
        "denominator graph: {} states, {} transitions, {} pdfs, on {:?}, built in {:?}",
        den_graph.num_states(),
        graph.num_transitions(),
        den_graph.num_pdfs(),
        den_graph.device(),
        start.elapsed()
    );

    let num_phones = (args.frames_per_sequence / 3).max(1);
    let graphs = (0..args.num_sequences)
        .map(|_| random_num_graph(&mut rng, num_phones, args.num_pdfs).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let supervision = Supervision::new(1.0, args.frames_per_sequence, graphs)?;
    let rows = supervision.num_rows();
    let nnet_output = random_output(&mut rng, rows, args.num_pdfs, dtype, &device)?;
    let xent_output = if args.xent {
        Some(random_output(&mut rng, rows, args.num_pdfs, dtype, &device)?)
    } else {
        None
    };

    let mut nnet_output_deriv = nnet_output.zeros_like()?;
    let mut xent_output_deriv = match &xent_output {
        Some(xent_output) => Some(xent_output.zeros_like()?),
        None => None,
    };
    let start = std::time::Instant::now();
    let objf = compute_chain_objf_and_deriv(
        &opts,
        &den_graph,
        &supervision,
        &nnet_output,
        xent_output.as_ref(),
        Some(&mut nnet_output_deriv),
        xent_output_deriv.as_mut(),
    )?;
    let elapsed = start.elapsed();

    println!("objf per frame: {:.6}", objf.objf_per_frame());
    println!("l2 term per frame: {:.6}", objf.l2_term_per_frame());
    println!("weight: {}", objf.weight);
    let deriv_norm = nnet_output_deriv
        .to_dtype(DType::F64)?
        .sqr()?
        .sum_all()?
        .to_scalar::<f64>()?
        .sqrt();
    println!("nnet output derivative norm: {deriv_norm:.6}");
    if let Some(xent_output_deriv) = &xent_output_deriv {
        let norm = xent_output_deriv
            .to_dtype(DType::F64)?
            .sqr()?
            .sum_all()?
            .to_scalar::<f64>()?
            .sqrt();
        println!("xent output derivative norm: {norm:.6}");
    }
    println!(
        "{rows} frames in {elapsed:?}, {:.1} frames/s",
        rows as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}

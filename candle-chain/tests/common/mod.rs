#![allow(dead_code)]

use candle::{DType, Device, Result, Tensor};
use candle_chain::{Graph, Transition};
use rand::rngs::StdRng;
use rand::Rng;

/// A denominator-like graph: a ring so every state is reachable and final, a self-loop per
/// state and a few random extra arcs. Outgoing probabilities of each state sum to one and the
/// initial distribution is uniform.
pub fn random_den_graph(rng: &mut StdRng, num_states: usize, num_pdfs: usize) -> Result<Graph> {
    let mut arcs: Vec<(u32, u32)> = Vec::new();
    for s in 0..num_states as u32 {
        arcs.push((s, s));
        arcs.push((s, (s + 1) % num_states as u32));
        for _ in 0..rng.random_range(0..3) {
            arcs.push((s, rng.random_range(0..num_states as u32)));
        }
    }
    let mut transitions = Vec::with_capacity(arcs.len());
    for s in 0..num_states as u32 {
        let outgoing: Vec<(u32, f32)> = arcs
            .iter()
            .filter(|&&(src, _)| src == s)
            .map(|&(_, dst)| (dst, rng.random_range(0.1f32..1.0)))
            .collect();
        let tot: f32 = outgoing.iter().map(|&(_, w)| w).sum();
        for (dst, w) in outgoing {
            let pdf_id = rng.random_range(0..num_pdfs as u32);
            transitions.push(Transition::new(s, dst, pdf_id, (w / tot).ln()));
        }
    }
    let uniform = -(num_states as f32).ln();
    let initial: Vec<(u32, f32)> = (0..num_states as u32).map(|s| (s, uniform)).collect();
    let finals: Vec<(u32, f32)> = (0..num_states as u32).map(|s| (s, 0.0)).collect();
    Graph::new(num_states, &initial, &finals, transitions)
}

/// A left-to-right supervision graph: the first arc into segment `i` and its self-loop both
/// emit `pdfs[i]`. Accepts any number of frames `>= pdfs.len()`.
pub fn chain_num_graph(pdfs: &[u32]) -> Result<Graph> {
    let mut transitions = Vec::with_capacity(2 * pdfs.len());
    for (i, &pdf) in pdfs.iter().enumerate() {
        let i = i as u32;
        transitions.push(Transition::new(i, i + 1, pdf, 0.0));
        transitions.push(Transition::new(i + 1, i + 1, pdf, 0.0));
    }
    Graph::new(
        pdfs.len() + 1,
        &[(0, 0.0)],
        &[(pdfs.len() as u32, 0.0)],
        transitions,
    )
}

/// Uniform values in `[-scale, scale)`.
pub fn random_tensor(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    scale: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f64> = (0..rows * cols)
        .map(|_| scale * (2.0 * rng.random::<f64>() - 1.0))
        .collect();
    Tensor::from_vec(data, (rows, cols), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    a.to_dtype(DType::F64)?
        .sub(&b.to_dtype(DType::F64)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f64>()
}

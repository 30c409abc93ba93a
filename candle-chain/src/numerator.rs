//! Forward-backward over the supervision graphs.
//!
//! Each sequence of the minibatch is scored independently against its own graph. Supervision
//! graphs are small and touch only a handful of pdf-ids, so the recursion runs on the host in
//! `f64`: the output entries a sequence can read are gathered from the device with one
//! `index_select`, and the resulting posteriors are scattered back with one `index_add`.

use crate::graph::Graph;
use crate::ops::{log_add, log_sum_exp, to_host_f64};
use crate::supervision::Supervision;
use candle::{bail, Device, Result, Tensor};

/// Output entries read by one sequence: frame `t`, slot `k` lives at
/// `offset + t * pdf_ids.len() + k` in the gathered buffer.
#[derive(Debug)]
struct SequenceIndex {
    pdf_ids: Vec<u32>,
    // per transition id, position of its pdf-id in `pdf_ids`
    slots: Vec<usize>,
    offset: usize,
}

impl SequenceIndex {
    fn new(graph: &Graph, offset: usize) -> Self {
        let mut pdf_ids: Vec<u32> = graph.transitions().iter().map(|tr| tr.pdf_id).collect();
        pdf_ids.sort_unstable();
        pdf_ids.dedup();
        let slots = graph
            .transitions()
            .iter()
            .map(|tr| pdf_ids.partition_point(|&p| p < tr.pdf_id))
            .collect();
        Self {
            pdf_ids,
            slots,
            offset,
        }
    }

    fn len(&self, num_frames: usize) -> usize {
        num_frames * self.pdf_ids.len()
    }
}

pub struct NumeratorComputation<'a> {
    supervision: &'a Supervision,
    nnet_output: &'a Tensor,
    sequences: Vec<SequenceIndex>,
    // flat indexes into `nnet_output`, all sequences back to back
    output_index: Tensor,
    logprobs: Vec<f64>,
    // per sequence, (T + 1) x num_states, row-major
    alphas: Vec<Vec<f64>>,
    log_likelihoods: Vec<f64>,
    frame_log_likelihoods: Vec<Vec<f64>>,
    span: tracing::Span,
}

impl<'a> NumeratorComputation<'a> {
    pub fn new(supervision: &'a Supervision, nnet_output: &'a Tensor) -> Result<Self> {
        let (num_rows, num_pdfs) = nnet_output.dims2()?;
        if num_rows != supervision.num_rows() {
            bail!(
                "nnet output has {num_rows} rows, supervision expects {} sequences x {} frames",
                supervision.num_sequences(),
                supervision.frames_per_sequence()
            )
        }
        if num_rows * num_pdfs > u32::MAX as usize {
            bail!("nnet output too large to index: {num_rows} x {num_pdfs}")
        }
        let num_sequences = supervision.num_sequences();
        let num_frames = supervision.frames_per_sequence();

        let mut sequences = Vec::with_capacity(num_sequences);
        let mut output_index = Vec::new();
        for s in 0..num_sequences {
            let graph = supervision.graph(s);
            if let Some(max_pdf) = graph.max_pdf_id() {
                if max_pdf as usize >= num_pdfs {
                    bail!("numerator graph of sequence {s} uses pdf-id {max_pdf}, nnet output has {num_pdfs} columns")
                }
            }
            let seq = SequenceIndex::new(graph, output_index.len());
            for t in 0..num_frames {
                let row = t * num_sequences + s;
                output_index.extend(seq.pdf_ids.iter().map(|&p| (row * num_pdfs) as u32 + p));
            }
            sequences.push(seq);
        }
        let len = output_index.len();
        let output_index = Tensor::from_vec(output_index, len, nnet_output.device())?;

        Ok(Self {
            supervision,
            nnet_output,
            sequences,
            output_index,
            logprobs: Vec::new(),
            alphas: Vec::new(),
            log_likelihoods: Vec::new(),
            frame_log_likelihoods: Vec::new(),
            span: tracing::span!(tracing::Level::TRACE, "chain-numerator"),
        })
    }

    /// Runs the alpha recursion and returns the weighted total log-likelihood of the minibatch.
    pub fn forward(&mut self) -> Result<f64> {
        let _enter = self.span.enter();
        let num_frames = self.supervision.frames_per_sequence();
        self.logprobs = if self.output_index.dim(0)? == 0 {
            Vec::new()
        } else {
            let gathered = self
                .nnet_output
                .flatten_all()?
                .index_select(&self.output_index, 0)?;
            to_host_f64(&gathered)?
        };

        self.alphas.clear();
        self.log_likelihoods.clear();
        for (s, seq) in self.sequences.iter().enumerate() {
            let graph = self.supervision.graph(s);
            let n = graph.num_states();
            let logprobs = &self.logprobs[seq.offset..seq.offset + seq.len(num_frames)];
            let mut alpha = vec![f64::NEG_INFINITY; (num_frames + 1) * n];
            for (a, &init) in alpha.iter_mut().zip(graph.initial_log_probs()) {
                *a = init as f64;
            }
            let width = seq.pdf_ids.len();
            for t in 0..num_frames {
                let (done, rest) = alpha.split_at_mut((t + 1) * n);
                let prev = &done[t * n..];
                let next = &mut rest[..n];
                let frame = &logprobs[t * width..(t + 1) * width];
                for (j, next) in next.iter_mut().enumerate() {
                    let mut acc = f64::NEG_INFINITY;
                    for &id in graph.transition_ids_into(j as u32) {
                        let tr = &graph.transitions()[id as usize];
                        let a = prev[tr.src as usize];
                        if a == f64::NEG_INFINITY {
                            continue;
                        }
                        acc = log_add(acc, a + tr.log_prob as f64 + frame[seq.slots[id as usize]]);
                    }
                    *next = acc;
                }
            }
            let last = &alpha[num_frames * n..];
            let terms: Vec<f64> = last
                .iter()
                .zip(graph.final_log_probs())
                .map(|(&a, &f)| a + f as f64)
                .collect();
            self.log_likelihoods.push(log_sum_exp(&terms));
            self.alphas.push(alpha);
        }
        let total: f64 = self.log_likelihoods.iter().sum();
        Ok(self.supervision.weight() * total)
    }

    /// Runs the beta recursion and adds `weight * posterior(t, pdf)` into `nnet_output_deriv`.
    pub fn backward(&mut self, nnet_output_deriv: &mut Tensor) -> Result<()> {
        let _enter = self.span.enter();
        if self.alphas.len() != self.sequences.len() {
            bail!("numerator backward called before forward")
        }
        if nnet_output_deriv.dims() != self.nnet_output.dims() {
            bail!(
                "derivative shape {:?} does not match nnet output {:?}",
                nnet_output_deriv.dims(),
                self.nnet_output.dims()
            )
        }
        let num_frames = self.supervision.frames_per_sequence();
        let weight = self.supervision.weight();
        let mut derivs = vec![0f64; self.logprobs.len()];

        self.frame_log_likelihoods.clear();
        for (s, seq) in self.sequences.iter().enumerate() {
            let graph = self.supervision.graph(s);
            let n = graph.num_states();
            let width = seq.pdf_ids.len();
            let block = seq.offset..seq.offset + seq.len(num_frames);
            let logprobs = &self.logprobs[block.clone()];
            let derivs = &mut derivs[block];
            let alpha = &self.alphas[s];
            let total = self.log_likelihoods[s];

            let mut frame_totals = vec![0f64; num_frames + 1];
            let mut beta_next: Vec<f64> =
                graph.final_log_probs().iter().map(|&f| f as f64).collect();
            let mut beta = vec![f64::NEG_INFINITY; n];
            frame_totals[num_frames] = frame_total(&alpha[num_frames * n..], &beta_next);
            for t in (0..num_frames).rev() {
                let alpha_t = &alpha[t * n..(t + 1) * n];
                let frame = &logprobs[t * width..(t + 1) * width];
                let frame_derivs = &mut derivs[t * width..(t + 1) * width];
                for (i, beta_i) in beta.iter_mut().enumerate() {
                    let mut acc = f64::NEG_INFINITY;
                    for id in graph.transition_ids_from(i as u32) {
                        let tr = &graph.transitions()[id];
                        let b = beta_next[tr.dst as usize];
                        if b == f64::NEG_INFINITY {
                            continue;
                        }
                        let slot = seq.slots[id];
                        let arc = tr.log_prob as f64 + frame[slot] + b;
                        acc = log_add(acc, arc);
                        let a = alpha_t[i];
                        if a != f64::NEG_INFINITY {
                            frame_derivs[slot] += weight * (a + arc - total).exp();
                        }
                    }
                    *beta_i = acc;
                }
                frame_totals[t] = frame_total(alpha_t, &beta);
                std::mem::swap(&mut beta, &mut beta_next);
            }

            if total.is_finite() {
                let worst = frame_totals
                    .iter()
                    .map(|&v| (v - total).abs())
                    .fold(0f64, f64::max);
                if !(worst <= 1e-3 * total.abs().max(1.0)) {
                    tracing::warn!(
                        "numerator alpha/beta mismatch for sequence {s}: total {total}, max deviation {worst}"
                    );
                }
            }
            self.frame_log_likelihoods.push(frame_totals);
        }

        if derivs.is_empty() {
            return Ok(());
        }
        let (num_rows, num_pdfs) = self.nnet_output.dims2()?;
        let device = self.nnet_output.device();
        let len = derivs.len();
        let values = Tensor::from_vec(derivs, len, &Device::Cpu)?
            .to_device(device)?
            .to_dtype(nnet_output_deriv.dtype())?;
        let update = Tensor::zeros(num_rows * num_pdfs, values.dtype(), device)?
            .index_add(&self.output_index, &values, 0)?
            .reshape((num_rows, num_pdfs))?;
        *nnet_output_deriv = nnet_output_deriv.add(&update)?;
        Ok(())
    }

    /// Unweighted log-likelihood of each sequence, available after [`Self::forward`].
    pub fn log_likelihoods(&self) -> &[f64] {
        &self.log_likelihoods
    }

    /// `logsumexp_s(alpha(t, s) + beta(t, s))` for `t in 0..=T`, available after
    /// [`Self::backward`]. Every entry should equal the sequence's log-likelihood.
    pub fn frame_log_likelihoods(&self, sequence: usize) -> &[f64] {
        &self.frame_log_likelihoods[sequence]
    }
}

fn frame_total(alpha: &[f64], beta: &[f64]) -> f64 {
    let terms: Vec<f64> = alpha.iter().zip(beta).map(|(&a, &b)| a + b).collect();
    log_sum_exp(&terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Transition;
    use std::sync::Arc;

    // Two-state left-to-right graph: pdf 0 then pdf 1, each may repeat.
    fn left_to_right() -> Arc<Graph> {
        Arc::new(
            Graph::new(
                2,
                &[(0, 0.0)],
                &[(1, 0.0)],
                vec![
                    Transition::new(0, 0, 0, 0.0),
                    Transition::new(0, 1, 1, 0.0),
                    Transition::new(1, 1, 1, 0.0),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_counts_alignments() -> Result<()> {
        // With all-zero outputs and zero weights, exp(total) counts the paths of length T:
        // for T = 4 the switch to pdf 1 can happen on any of the 4 frames.
        let sup = Supervision::replicated(1.0, 1, 4, left_to_right())?;
        let out = Tensor::zeros((4, 3), candle::DType::F32, &Device::Cpu)?;
        let mut num = NumeratorComputation::new(&sup, &out)?;
        let logprob = num.forward()?;
        assert!((logprob - 4f64.ln()).abs() < 1e-9);

        let mut deriv = out.zeros_like()?;
        num.backward(&mut deriv)?;
        let deriv = deriv.to_vec2::<f32>()?;
        for (t, row) in deriv.iter().enumerate() {
            let pdf0 = (3 - t) as f32 / 4.0;
            assert!((row[0] - pdf0).abs() < 1e-6, "frame {t}: {row:?}");
            assert!((row[1] - (1.0 - pdf0)).abs() < 1e-6, "frame {t}: {row:?}");
            assert_eq!(row[2], 0.0);
        }
        for v in num.frame_log_likelihoods(0) {
            assert!((v - 4f64.ln()).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_weight_and_interleaving() -> Result<()> {
        let sup = Supervision::replicated(0.5, 2, 3, left_to_right())?;
        // sequence 0 on even rows, sequence 1 on odd rows
        let out = Tensor::new(
            &[
                [1f32, 0., 0.],
                [0., 0., 0.],
                [0., 2., 0.],
                [0., 0., 0.],
                [0., 0., 0.],
                [0., 0., 0.],
            ],
            &Device::Cpu,
        )?;
        let mut num = NumeratorComputation::new(&sup, &out)?;
        let logprob = num.forward()?;
        let lls = num.log_likelihoods().to_vec();
        // sequence 1 sees all zeros: 3 alignments of length 3
        assert!((lls[1] - 3f64.ln()).abs() < 1e-9);
        // sequence 0: pdf sequences [1,1,1] -> 2, [0,1,1] -> 3, [0,0,1] -> 1
        let expected = (2f64.exp() + 3f64.exp() + 1f64.exp()).ln();
        assert!((lls[0] - expected).abs() < 1e-6);
        assert!((logprob - 0.5 * (lls[0] + lls[1])).abs() < 1e-9);

        let mut deriv = out.zeros_like()?;
        num.backward(&mut deriv)?;
        let total: f32 = deriv.sum_all()?.to_scalar()?;
        assert!((total - 0.5 * 6.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() -> Result<()> {
        let sup = Supervision::replicated(1.0, 2, 3, left_to_right())?;
        let out = Tensor::zeros((5, 3), candle::DType::F32, &Device::Cpu)?;
        assert!(NumeratorComputation::new(&sup, &out).is_err());
        // pdf-id 1 is out of range for a single column
        let out = Tensor::zeros((6, 1), candle::DType::F32, &Device::Cpu)?;
        assert!(NumeratorComputation::new(&sup, &out).is_err());
        Ok(())
    }
}

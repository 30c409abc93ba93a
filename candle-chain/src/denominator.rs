//! Forward-backward over the shared denominator graph, batched over all sequences.
//!
//! Every sequence of a minibatch is scored against the same graph, so each frame of the
//! recursion is a handful of tensor kernels over a `(num_sequences, num_states)` alpha matrix:
//! gather the source states of every transition, multiply in the transition and emission
//! probabilities, scatter-add into the destination states. Values are kept in log space between
//! frames; within a frame they are exponentiated after subtracting the per-sequence maximum, so
//! each scatter-add is a log-sum-exp with max subtraction.
//!
//! Leaky-HMM smoothing: after every frame a fraction `c` of the total alpha mass is
//! redistributed according to the initial distribution `p0`,
//!
//! ```text
//! alpha'(t) = alpha(t) + c * sum_s(alpha(t, s)) * p0
//! ```
//!
//! and the backward pass applies the transposed operator, `beta(t) + c * dot(p0, beta(t))`. This
//! keeps `dot(alpha'(t), beta(t))` equal to the total likelihood at every frame and makes the
//! derivative exact for the smoothed objective.

use crate::graph::{Graph, Transition};
use crate::ops::{exp_scaled, log_sum_exp_keepdim, sum_to_f64, to_host_f64};
use crate::training::ChainTrainingOptions;
use candle::{bail, DType, Device, Result, Tensor};
use std::sync::Arc;

/// Number of HMM propagation steps averaged by [`DenominatorGraph::from_start_state`].
const INITIAL_PROB_ITERS: usize = 100;

/// Relative deviation of the per-frame alpha-beta product that triggers a warning.
const ALPHA_BETA_WARN_TOLERANCE: f64 = 1e-3;

/// Largest deviation of a sequence's per-frame alpha-beta total from its log-likelihood,
/// relative to `max(1, |log-likelihood|)`, before the pass is declared unstable.
const ALPHA_BETA_MAX_RELATIVE_ERROR: f64 = 1e-2;

/// Largest deviation from 1 of the posterior mass on one frame of one sequence.
const POSTERIOR_MASS_TOLERANCE: f64 = 1e-2;

/// The shared denominator graph, with its transitions uploaded to a device.
#[derive(Debug, Clone)]
pub struct DenominatorGraph {
    graph: Arc<Graph>,
    num_pdfs: usize,
    initial_probs: Vec<f32>,
    src: Tensor,
    dst: Tensor,
    pdf_ids: Tensor,
    log_probs: Tensor,
    probs: Tensor,
    initial_log_probs_t: Tensor,
    initial_probs_t: Tensor,
    final_log_probs_t: Tensor,
}

impl DenominatorGraph {
    /// Uploads `graph` to `device`. The initial distribution of the graph is renormalized to sum
    /// to one.
    pub fn new(graph: Arc<Graph>, num_pdfs: usize, device: &Device) -> Result<Self> {
        if graph.num_transitions() == 0 {
            bail!("denominator graph has no transitions")
        }
        match graph.max_pdf_id() {
            Some(max_pdf) if max_pdf as usize >= num_pdfs => {
                bail!("denominator graph uses pdf-id {max_pdf} but num_pdfs is {num_pdfs}")
            }
            _ => {}
        }
        let initial: Vec<f64> = graph
            .initial_log_probs()
            .iter()
            .map(|&w| (w as f64).exp())
            .collect();
        let tot: f64 = initial.iter().sum();
        if !(tot.is_finite() && tot > 0.0) {
            bail!("denominator graph initial weights sum to {tot}")
        }
        let initial_probs: Vec<f32> = initial.iter().map(|&p| (p / tot) as f32).collect();
        let initial_log_probs: Vec<f32> = initial_probs.iter().map(|&p| p.ln()).collect();

        let transitions = graph.transitions();
        let num_arcs = transitions.len();
        let num_states = graph.num_states();
        let column = |f: fn(&Transition) -> u32| -> Result<Tensor> {
            let v: Vec<u32> = transitions.iter().map(f).collect();
            Tensor::from_vec(v, num_arcs, device)
        };
        let src = column(|tr: &Transition| tr.src)?;
        let dst = column(|tr: &Transition| tr.dst)?;
        let pdf_ids = column(|tr: &Transition| tr.pdf_id)?;
        let log_probs: Vec<f32> = transitions.iter().map(|tr| tr.log_prob).collect();
        let log_probs = Tensor::from_vec(log_probs, num_arcs, device)?;
        let probs = log_probs.exp()?;
        let initial_log_probs_t = Tensor::from_vec(initial_log_probs, num_states, device)?;
        let initial_probs_t = Tensor::from_slice(&initial_probs, num_states, device)?;
        let final_log_probs_t = Tensor::from_slice(graph.final_log_probs(), num_states, device)?;

        Ok(Self {
            graph,
            num_pdfs,
            initial_probs,
            src,
            dst,
            pdf_ids,
            log_probs,
            probs,
            initial_log_probs_t,
            initial_probs_t,
            final_log_probs_t,
        })
    }

    /// Builds a denominator graph whose initial distribution is the average state occupancy of
    /// the first 100 frames of HMM propagation from `start`.
    ///
    /// Each state's outgoing weights, including its final weight, are normalized to sum to one
    /// before propagating, and the occupancy is renormalized after every step. If all mass
    /// reaches dead ends the average is taken over the steps completed so far.
    pub fn from_start_state(
        graph: &Graph,
        start: u32,
        num_pdfs: usize,
        device: &Device,
    ) -> Result<Self> {
        let probs = stationary_initial_probs(graph, start, INITIAL_PROB_ITERS)?;
        let initial: Vec<(u32, f32)> = probs
            .iter()
            .enumerate()
            .filter(|&(_, &p)| p > 0.0)
            .map(|(s, &p)| (s as u32, p.ln() as f32))
            .collect();
        let graph = graph.with_initial(&initial)?;
        Self::new(Arc::new(graph), num_pdfs, device)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn num_pdfs(&self) -> usize {
        self.num_pdfs
    }

    pub fn num_states(&self) -> usize {
        self.graph.num_states()
    }

    /// Normalized initial distribution, also the target of the leaky-HMM redistribution.
    pub fn initial_probs(&self) -> &[f32] {
        &self.initial_probs
    }

    pub fn device(&self) -> &Device {
        self.src.device()
    }
}

fn stationary_initial_probs(graph: &Graph, start: u32, num_iters: usize) -> Result<Vec<f64>> {
    let n = graph.num_states();
    if start as usize >= n {
        bail!("start state {start} out of range for {n} states")
    }
    let normalizer: Vec<f64> = (0..n as u32)
        .map(|s| {
            let tot = graph
                .transitions_from(s)
                .iter()
                .fold((graph.final_log_prob(s) as f64).exp(), |acc, tr| {
                    acc + (tr.log_prob as f64).exp()
                });
            if tot > 0.0 {
                1.0 / tot
            } else {
                0.0
            }
        })
        .collect();

    let mut cur = vec![0f64; n];
    cur[start as usize] = 1.0;
    let mut avg = vec![0f64; n];
    for _ in 0..num_iters {
        for (a, &c) in avg.iter_mut().zip(cur.iter()) {
            *a += c;
        }
        let mut next = vec![0f64; n];
        for (s, &mass) in cur.iter().enumerate() {
            let mass = mass * normalizer[s];
            if mass == 0.0 {
                continue;
            }
            for tr in graph.transitions_from(s as u32) {
                next[tr.dst as usize] += mass * (tr.log_prob as f64).exp();
            }
        }
        let tot: f64 = next.iter().sum();
        if !(tot > 0.0) {
            break;
        }
        next.iter_mut().for_each(|v| *v /= tot);
        cur = next;
    }
    let tot: f64 = avg.iter().sum();
    Ok(avg.into_iter().map(|v| v / tot).collect())
}

/// Forward-backward over a [`DenominatorGraph`] for one minibatch. Run [`Self::forward`] once,
/// then optionally [`Self::backward`] once.
pub struct DenominatorComputation<'a> {
    opts: &'a ChainTrainingOptions,
    nnet_output: &'a Tensor,
    num_sequences: usize,
    frames_per_sequence: usize,
    num_states: usize,
    num_pdfs: usize,
    // graph tensors on the output's device, in the output's dtype
    src: Tensor,
    dst: Tensor,
    pdf_ids: Tensor,
    log_probs: Tensor,
    probs: Tensor,
    initial_log_probs: Tensor,
    initial_probs: Tensor,
    final_log_probs: Tensor,
    // alpha'(t) for t in 0..=T, each (num_sequences, num_states), log space
    alphas: Vec<Tensor>,
    log_likelihoods: Option<Tensor>,
    frame_log_likelihoods: Option<Tensor>,
    span: tracing::Span,
}

impl<'a> DenominatorComputation<'a> {
    pub fn new(
        opts: &'a ChainTrainingOptions,
        den_graph: &'a DenominatorGraph,
        num_sequences: usize,
        nnet_output: &'a Tensor,
    ) -> Result<Self> {
        let (num_rows, num_pdfs) = nnet_output.dims2()?;
        if num_sequences == 0 || num_rows == 0 || num_rows % num_sequences != 0 {
            bail!("nnet output has {num_rows} rows, not a positive multiple of {num_sequences} sequences")
        }
        if num_pdfs != den_graph.num_pdfs() {
            bail!(
                "nnet output has {num_pdfs} columns, denominator graph expects {}",
                den_graph.num_pdfs()
            )
        }
        let device = nnet_output.device();
        let dtype = nnet_output.dtype();
        let to_output = |t: &Tensor| t.to_device(device)?.to_dtype(dtype);
        Ok(Self {
            opts,
            nnet_output,
            num_sequences,
            frames_per_sequence: num_rows / num_sequences,
            num_states: den_graph.num_states(),
            num_pdfs,
            src: den_graph.src.to_device(device)?,
            dst: den_graph.dst.to_device(device)?,
            pdf_ids: den_graph.pdf_ids.to_device(device)?,
            log_probs: to_output(&den_graph.log_probs)?,
            probs: to_output(&den_graph.probs)?,
            initial_log_probs: to_output(&den_graph.initial_log_probs_t)?,
            initial_probs: to_output(&den_graph.initial_probs_t)?,
            final_log_probs: to_output(&den_graph.final_log_probs_t)?,
            alphas: Vec::new(),
            log_likelihoods: None,
            frame_log_likelihoods: None,
            span: tracing::span!(tracing::Level::TRACE, "chain-denominator"),
        })
    }

    fn frame_output(&self, t: usize) -> Result<Tensor> {
        self.nnet_output
            .narrow(0, t * self.num_sequences, self.num_sequences)
    }

    fn zeros(&self, cols: usize) -> Result<Tensor> {
        Tensor::zeros(
            (self.num_sequences, cols),
            self.nnet_output.dtype(),
            self.nnet_output.device(),
        )
    }

    // x + c * sum(x) * p0, on max-scaled probabilities
    fn leak(&self, scaled: &Tensor) -> Result<Tensor> {
        let c = self.opts.leaky_hmm_coefficient;
        if c == 0.0 {
            return Ok(scaled.clone());
        }
        let tot = scaled.sum_keepdim(1)?;
        scaled.broadcast_add(&tot.broadcast_mul(&self.initial_probs)?.affine(c, 0.)?)
    }

    // x + c * dot(p0, x), the transpose of `leak`
    fn leak_transposed(&self, scaled: &Tensor) -> Result<Tensor> {
        let c = self.opts.leaky_hmm_coefficient;
        if c == 0.0 {
            return Ok(scaled.clone());
        }
        let dot = scaled.broadcast_mul(&self.initial_probs)?.sum_keepdim(1)?;
        scaled.broadcast_add(&dot.affine(c, 0.)?)
    }

    /// Runs the alpha recursion and returns the total log-likelihood of all sequences.
    pub fn forward(&mut self) -> Result<f64> {
        let _enter = self.span.enter();
        let shape = (self.num_sequences, self.num_states);
        let init = self
            .initial_log_probs
            .unsqueeze(0)?
            .broadcast_as(shape)?
            .contiguous()?;
        let (scaled, shift) = exp_scaled(&init, 1)?;
        let mut alpha = self.leak(&scaled)?.log()?.broadcast_add(&shift)?;

        self.alphas = Vec::with_capacity(self.frames_per_sequence + 1);
        self.alphas.push(alpha.clone());
        for t in 0..self.frames_per_sequence {
            let out_t = self.frame_output(t)?;
            let (alpha_scaled, alpha_shift) = exp_scaled(&alpha, 1)?;
            let (emit, out_shift) = exp_scaled(&out_t, 1)?;
            let contrib = alpha_scaled
                .index_select(&self.src, 1)?
                .mul(&emit.index_select(&self.pdf_ids, 1)?)?
                .broadcast_mul(&self.probs)?;
            let next = self.zeros(self.num_states)?.index_add(&self.dst, &contrib, 1)?;
            alpha = self
                .leak(&next)?
                .log()?
                .broadcast_add(&alpha_shift.add(&out_shift)?)?;
            self.alphas.push(alpha.clone());
        }

        let totals = log_sum_exp_keepdim(&alpha.broadcast_add(&self.final_log_probs)?, 1)?;
        let total = sum_to_f64(&totals)?;
        self.log_likelihoods = Some(totals);
        Ok(total)
    }

    /// Runs the beta recursion and adds `deriv_weight * d(logprob)/d(nnet_output)` into
    /// `nnet_output_deriv`.
    ///
    /// Returns `false` when the alpha-beta products or the derivatives are inconsistent, which
    /// means the recursion was numerically unstable for this minibatch.
    pub fn backward(&mut self, deriv_weight: f64, nnet_output_deriv: &mut Tensor) -> Result<bool> {
        let _enter = self.span.enter();
        let totals = match &self.log_likelihoods {
            Some(totals) if self.alphas.len() == self.frames_per_sequence + 1 => totals.clone(),
            _ => bail!("denominator backward called before forward"),
        };
        if nnet_output_deriv.dims() != self.nnet_output.dims() {
            bail!(
                "derivative shape {:?} does not match nnet output {:?}",
                nnet_output_deriv.dims(),
                self.nnet_output.dims()
            )
        }
        let num_frames = self.frames_per_sequence;
        let shape = (self.num_sequences, self.num_states);

        let mut beta = self
            .final_log_probs
            .unsqueeze(0)?
            .broadcast_as(shape)?
            .contiguous()?;
        let mut frame_totals = Vec::with_capacity(num_frames + 1);
        frame_totals.push(log_sum_exp_keepdim(&self.alphas[num_frames].add(&beta)?, 1)?);
        let mut derivs = Vec::with_capacity(num_frames);
        for t in (0..num_frames).rev() {
            let out_t = self.frame_output(t)?;
            let (beta_scaled, beta_shift) = exp_scaled(&beta, 1)?;
            let beta_hat = self.leak_transposed(&beta_scaled)?;
            let beta_hat_log = beta_hat.log()?.broadcast_add(&beta_shift)?;
            let (emit, out_shift) = exp_scaled(&out_t, 1)?;
            let contrib = beta_hat
                .index_select(&self.dst, 1)?
                .mul(&emit.index_select(&self.pdf_ids, 1)?)?
                .broadcast_mul(&self.probs)?;
            let prev = self.zeros(self.num_states)?.index_add(&self.src, &contrib, 1)?;
            let beta_t = prev.log()?.broadcast_add(&beta_shift.add(&out_shift)?)?;

            let alpha_t = &self.alphas[t];
            let log_post = alpha_t
                .index_select(&self.src, 1)?
                .broadcast_add(&self.log_probs)?
                .add(&out_t.index_select(&self.pdf_ids, 1)?)?
                .add(&beta_hat_log.index_select(&self.dst, 1)?)?
                .broadcast_sub(&totals)?;
            let deriv_t = self
                .zeros(self.num_pdfs)?
                .index_add(&self.pdf_ids, &log_post.exp()?, 1)?;
            derivs.push(deriv_t);

            frame_totals.push(log_sum_exp_keepdim(&alpha_t.add(&beta_t)?, 1)?);
            beta = beta_t;
        }
        derivs.reverse();
        frame_totals.reverse();

        let deriv = Tensor::cat(&derivs, 0)?;
        let frame_totals = Tensor::cat(&frame_totals, 1)?.t()?.contiguous()?;
        let ok = self.check_consistency(&frame_totals, &totals, &deriv)?;
        self.frame_log_likelihoods = Some(frame_totals);

        let update = deriv
            .affine(deriv_weight, 0.)?
            .to_dtype(nnet_output_deriv.dtype())?;
        *nnet_output_deriv = nnet_output_deriv.add(&update)?;
        Ok(ok)
    }

    fn check_consistency(
        &self,
        frame_totals: &Tensor,
        totals: &Tensor,
        deriv: &Tensor,
    ) -> Result<bool> {
        let num_sequences = self.num_sequences;
        let totals = to_host_f64(totals)?;
        // (T + 1) x num_sequences, row-major
        let frame_totals = to_host_f64(frame_totals)?;
        for (t, frame) in frame_totals.chunks(num_sequences).enumerate() {
            // sum over sequences of exp(frame_total - total); num_sequences when consistent
            let product: f64 = frame
                .iter()
                .zip(totals.iter())
                .map(|(&f, &total)| (f - total).exp())
                .sum();
            let err = (product - num_sequences as f64).abs();
            if err > ALPHA_BETA_WARN_TOLERANCE * num_sequences as f64 || !product.is_finite() {
                tracing::warn!("on frame {t}, alpha-beta product {product} != {num_sequences}");
                if !(err <= self.opts.max_alpha_beta_error) {
                    tracing::warn!("excessive alpha-beta error, will abandon this minibatch");
                    return Ok(false);
                }
            }
            // per sequence, in log space
            for (s, (&f, &total)) in frame.iter().zip(totals.iter()).enumerate() {
                let rel_err = (f - total).abs() / total.abs().max(1.0);
                if !(rel_err <= ALPHA_BETA_MAX_RELATIVE_ERROR) {
                    tracing::warn!(
                        "on frame {t}, sequence {s} has alpha-beta total {f} but log-likelihood \
                         {total}, will abandon this minibatch"
                    );
                    return Ok(false);
                }
            }
        }
        // every frame of every sequence carries one unit of posterior mass
        let masses = to_host_f64(&deriv.sum(1)?)?;
        for (row, &mass) in masses.iter().enumerate() {
            if !((mass - 1.0).abs() <= POSTERIOR_MASS_TOLERANCE) {
                tracing::warn!(
                    "denominator posterior mass {mass} on row {row}, will abandon this minibatch"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Per-sequence log-likelihoods, shape `(num_sequences, 1)`, available after forward.
    pub fn log_likelihoods(&self) -> Option<&Tensor> {
        self.log_likelihoods.as_ref()
    }

    /// `alpha'(t)` in log space, shape `(num_sequences, num_states)`, for `t in 0..=T`.
    pub fn alpha(&self, t: usize) -> Option<&Tensor> {
        self.alphas.get(t)
    }

    /// `logsumexp_s(alpha'(t, s) + beta(t, s))`, shape `(T + 1, num_sequences)`, available after
    /// backward. Each row should match [`Self::log_likelihoods`].
    pub fn frame_log_likelihoods(&self) -> Option<&Tensor> {
        self.frame_log_likelihoods.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stationary_initial_probs() -> Result<()> {
        // two states flipping deterministically, with negligible final weights: occupancy
        // averages to one half each
        let g = Graph::new(
            2,
            &[(0, 0.0)],
            &[(0, -1e10), (1, -1e10)],
            vec![Transition::new(0, 1, 0, 0.0), Transition::new(1, 0, 1, 0.0)],
        )?;
        let probs = stationary_initial_probs(&g, 0, 100)?;
        assert!((probs[0] - 0.5).abs() < 1e-9);
        assert!((probs[1] - 0.5).abs() < 1e-9);

        // dead end after one step: average of the two steps taken
        let g = Graph::new(
            2,
            &[(0, 0.0)],
            &[(1, 0.0)],
            vec![Transition::new(0, 1, 0, 0.0)],
        )?;
        let probs = stationary_initial_probs(&g, 0, 100)?;
        assert!((probs[0] - 0.5).abs() < 1e-9);
        assert!((probs[1] - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_graph_validation() -> Result<()> {
        let g = Arc::new(Graph::new(
            2,
            &[(0, 0.0)],
            &[(1, 0.0)],
            vec![Transition::new(0, 1, 3, 0.0)],
        )?);
        assert!(DenominatorGraph::new(g.clone(), 3, &Device::Cpu).is_err());
        let den = DenominatorGraph::new(g, 4, &Device::Cpu)?;
        assert_eq!(den.num_pdfs(), 4);
        assert_eq!(den.initial_probs(), [1.0, 0.0]);

        let opts = ChainTrainingOptions::default();
        let out = Tensor::zeros((6, 5), DType::F32, &Device::Cpu)?;
        assert!(DenominatorComputation::new(&opts, &den, 2, &out).is_err());
        let out = Tensor::zeros((6, 4), DType::F32, &Device::Cpu)?;
        assert!(DenominatorComputation::new(&opts, &den, 4, &out).is_err());
        assert!(DenominatorComputation::new(&opts, &den, 3, &out).is_ok());
        Ok(())
    }
}

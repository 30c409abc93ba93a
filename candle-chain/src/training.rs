//! The chain objective: numerator minus weighted denominator log-likelihood, with its
//! derivative and the optional l2 regularizer.

use crate::denominator::{DenominatorComputation, DenominatorGraph};
use crate::numerator::NumeratorComputation;
use crate::ops::{sum_to_f64, to_host_f64};
use crate::supervision::Supervision;
use candle::{bail, Error, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Columns of the auxiliary output whose variance is below this fraction of their second
/// moment are treated as constant by the l2 regression.
const MIN_RELATIVE_VARIANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainTrainingOptions {
    /// l2 penalty on the chain output, or on its deviation from a linear function of the
    /// cross-entropy output when one is given. 0 disables it.
    pub l2_regularize: f64,
    /// Fraction of the alpha mass redistributed to the initial distribution on every frame of
    /// the denominator recursion.
    pub leaky_hmm_coefficient: f64,
    /// Largest tolerated deviation of the per-frame alpha-beta product (summed over sequences)
    /// from the number of sequences, before the denominator pass is declared unstable.
    pub max_alpha_beta_error: f64,
    /// Objective per frame reported for minibatches whose computation was unstable.
    pub default_objf_per_frame: f64,
    /// Diagnostics level; 1 or more logs the derivative magnitude per frame.
    pub verbose: u32,
}

impl Default for ChainTrainingOptions {
    fn default() -> Self {
        Self {
            l2_regularize: 0.0,
            leaky_hmm_coefficient: 1.0e-05,
            max_alpha_beta_error: 2.0,
            default_objf_per_frame: -10.0,
            verbose: 0,
        }
    }
}

impl ChainTrainingOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.l2_regularize >= 0.0 && self.l2_regularize.is_finite()) {
            bail!("l2-regularize must be non-negative, got {}", self.l2_regularize)
        }
        if !(self.leaky_hmm_coefficient >= 0.0 && self.leaky_hmm_coefficient < 1.0) {
            bail!(
                "leaky-hmm-coefficient must be in [0, 1), got {}",
                self.leaky_hmm_coefficient
            )
        }
        if !(self.max_alpha_beta_error > 0.0) {
            bail!(
                "max-alpha-beta-error must be positive, got {}",
                self.max_alpha_beta_error
            )
        }
        if !self.default_objf_per_frame.is_finite() {
            bail!(
                "default-objf-per-frame must be finite, got {}",
                self.default_objf_per_frame
            )
        }
        Ok(())
    }

    /// Parses options from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(json).map_err(Error::wrap)?;
        opts.validate()?;
        Ok(opts)
    }
}

/// The scalars produced for one minibatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainObjective {
    /// Weighted objective, summed over all frames.
    pub objf: f64,
    /// Value of the l2 regularizer, 0 when disabled.
    pub l2_term: f64,
    /// `supervision.weight * num_sequences * frames_per_sequence`, the normalizer for
    /// per-frame reporting.
    pub weight: f64,
}

impl ChainObjective {
    pub fn objf_per_frame(&self) -> f64 {
        self.objf / self.weight
    }

    pub fn l2_term_per_frame(&self) -> f64 {
        self.l2_term / self.weight
    }
}

/// One of the two log-likelihood terms of the objective. The derivative scale of each term is
/// fixed when it is built.
enum ChainTerm<'a> {
    Numerator(NumeratorComputation<'a>),
    Denominator {
        computation: DenominatorComputation<'a>,
        deriv_weight: f64,
    },
}

impl ChainTerm<'_> {
    /// Contribution of this term to the objective.
    fn forward(&mut self) -> Result<f64> {
        match self {
            Self::Numerator(numerator) => numerator.forward(),
            Self::Denominator {
                computation,
                deriv_weight,
            } => Ok(*deriv_weight * computation.forward()?),
        }
    }

    /// Adds the derivative of [`Self::forward`] into `deriv`. Returns `false` if the term
    /// detected a numerical problem.
    fn backward(&mut self, deriv: &mut Tensor) -> Result<bool> {
        match self {
            Self::Numerator(numerator) => {
                numerator.backward(deriv)?;
                Ok(true)
            }
            Self::Denominator {
                computation,
                deriv_weight,
            } => computation.backward(*deriv_weight, deriv),
        }
    }
}

fn check_dims(what: &str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        bail!("{what} has shape {:?}, expected {expected:?}", t.dims())
    }
    Ok(())
}

fn accumulate(deriv: &mut Tensor, update: &Tensor) -> Result<()> {
    *deriv = deriv.add(&update.to_dtype(deriv.dtype())?)?;
    Ok(())
}

/// Computes the chain objective and its derivatives for one minibatch.
///
/// `nnet_output` has one row per frame, interleaved by sequence (see [`Supervision`]), and one
/// column per pdf-id. `xent_output` is the optional cross-entropy branch output of the same
/// shape, used only by the l2 regularizer.
///
/// When present, `nnet_output_deriv` is overwritten with the derivative of the objective (plus
/// l2 term) w.r.t. `nnet_output`. `xent_output_deriv`, when present, receives the numerator
/// posteriors, which are the cross-entropy targets, plus the l2 derivative w.r.t.
/// `xent_output`.
///
/// If the objective is not finite or the denominator recursion was unstable, both derivatives
/// are zeroed and the objective is replaced by `default_objf_per_frame * weight`; this is
/// reported with a warning, not an error. Errors are returned only for invalid options or
/// inputs whose shapes do not agree.
pub fn compute_chain_objf_and_deriv(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Tensor,
    xent_output: Option<&Tensor>,
    mut nnet_output_deriv: Option<&mut Tensor>,
    mut xent_output_deriv: Option<&mut Tensor>,
) -> Result<ChainObjective> {
    opts.validate()?;
    let dims = [supervision.num_rows(), den_graph.num_pdfs()];
    check_dims("nnet output", nnet_output, &dims)?;
    if let Some(xent_output) = xent_output {
        check_dims("xent output", xent_output, &dims)?;
    }
    if let Some(deriv) = nnet_output_deriv.as_deref() {
        check_dims("nnet output derivative", deriv, &dims)?;
    }
    if let Some(deriv) = xent_output_deriv.as_deref() {
        check_dims("xent output derivative", deriv, &dims)?;
    }
    let span = tracing::span!(tracing::Level::TRACE, "chain-objf");
    let _enter = span.enter();

    if let Some(deriv) = nnet_output_deriv.as_deref_mut() {
        *deriv = deriv.zeros_like()?;
    }

    let num_logprob_weighted = {
        let computation = NumeratorComputation::new(supervision, nnet_output)?;
        let mut numerator = ChainTerm::Numerator(computation);
        let logprob = numerator.forward()?;
        match (nnet_output_deriv.as_deref_mut(), xent_output_deriv.as_deref_mut()) {
            (Some(deriv), xent_deriv) => {
                numerator.backward(deriv)?;
                if let Some(xent_deriv) = xent_deriv {
                    *xent_deriv = deriv.to_dtype(xent_deriv.dtype())?;
                }
            }
            // cross-entropy derivatives without chain derivatives
            (None, Some(xent_deriv)) => {
                *xent_deriv = xent_deriv.zeros_like()?;
                numerator.backward(xent_deriv)?;
            }
            (None, None) => {}
        }
        logprob
    };

    let mut denominator = ChainTerm::Denominator {
        computation: DenominatorComputation::new(
            opts,
            den_graph,
            supervision.num_sequences(),
            nnet_output,
        )?,
        deriv_weight: -supervision.weight(),
    };
    let den_logprob_weighted = denominator.forward()?;
    let ok = match nnet_output_deriv.as_deref_mut() {
        Some(deriv) => denominator.backward(deriv)?,
        None => true,
    };

    let weight = supervision.frame_weight();
    let mut objf = num_logprob_weighted + den_logprob_weighted;
    if !objf.is_finite() || !ok {
        if let Some(deriv) = nnet_output_deriv.as_deref_mut() {
            *deriv = deriv.zeros_like()?;
        }
        if let Some(deriv) = xent_output_deriv.as_deref_mut() {
            *deriv = deriv.zeros_like()?;
        }
        let default_objf = opts.default_objf_per_frame;
        tracing::warn!(
            "objective function is {objf} and denominator computation (if done) returned {ok}, \
             setting objective function to {default_objf} per frame"
        );
        objf = default_objf * weight;
    }

    if opts.verbose >= 1 {
        if let Some(deriv) = nnet_output_deriv.as_deref() {
            log_derivs_per_frame(deriv, supervision)?;
        }
    }

    let l2_term = if opts.l2_regularize == 0.0 {
        0.0
    } else {
        l2_regularize(
            opts,
            supervision,
            nnet_output,
            xent_output,
            nnet_output_deriv,
            xent_output_deriv,
        )?
    };

    Ok(ChainObjective {
        objf,
        l2_term,
        weight,
    })
}

// Derivatives are smaller towards the edges of the sequences, this shows by how much.
fn log_derivs_per_frame(deriv: &Tensor, supervision: &Supervision) -> Result<()> {
    let per_frame = deriv
        .sqr()?
        .sum(1)?
        .reshape((
            supervision.frames_per_sequence(),
            supervision.num_sequences(),
        ))?
        .sum(1)?;
    let per_frame = to_host_f64(&per_frame)?;
    tracing::info!("derivs per frame are {per_frame:?}");
    Ok(())
}

/// Adds the l2 regularizer's derivatives and returns its value.
///
/// With a cross-entropy output `x`, the chain output `y` is regressed per column onto
/// `scale * x + offset` by least squares over the minibatch rows and the residual is penalized:
/// `-0.5 * l2 * weight * ||scale * x + offset - y||^2`. Without one, `y` itself is penalized.
fn l2_regularize(
    opts: &ChainTrainingOptions,
    supervision: &Supervision,
    nnet_output: &Tensor,
    xent_output: Option<&Tensor>,
    nnet_output_deriv: Option<&mut Tensor>,
    xent_output_deriv: Option<&mut Tensor>,
) -> Result<f64> {
    let scale_coeff = supervision.weight() * opts.l2_regularize;
    let xent_output = match xent_output {
        Some(xent_output) => xent_output,
        None => {
            let l2_term = -0.5 * scale_coeff * sum_to_f64(&nnet_output.sqr()?)?;
            if let Some(deriv) = nnet_output_deriv {
                accumulate(deriv, &nnet_output.affine(-scale_coeff, 0.)?)?;
            }
            return Ok(l2_term);
        }
    };

    // scale_i = [sum_j y_ji x_ji - 1/m sum_j y_ji sum_j x_ji] / [sum_j x_ji^2 - 1/m (sum_j x_ji)^2]
    // offset_i = 1/m sum_j (y_ji - scale_i x_ji)
    let inv_rows = 1.0 / nnet_output.dim(0)? as f64;
    let nnet_col_sum = nnet_output.sum_keepdim(0)?;
    let xent_col_sum = xent_output.sum_keepdim(0)?;
    let scale_num = xent_output
        .mul(nnet_output)?
        .sum_keepdim(0)?
        .sub(&nnet_col_sum.mul(&xent_col_sum)?.affine(inv_rows, 0.)?)?;
    let xent_sq_sum = xent_output.sqr()?.sum_keepdim(0)?;
    let scale_den = xent_sq_sum.sub(&xent_col_sum.sqr()?.affine(inv_rows, 0.)?)?;
    // a constant column fits any scale; use 0 so the offset becomes the column mean
    let varying = scale_den.gt(&xent_sq_sum.affine(MIN_RELATIVE_VARIANCE, 0.)?)?;
    let safe_den = varying.where_cond(&scale_den, &scale_den.ones_like()?)?;
    let scale = varying.where_cond(&scale_num.div(&safe_den)?, &scale_den.zeros_like()?)?;
    let offset = nnet_col_sum
        .sub(&scale.mul(&xent_col_sum)?)?
        .affine(inv_rows, 0.)?;
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(
            "l1_norm(scale) = {}, l1_norm(offset) = {}",
            sum_to_f64(&scale.abs()?)?,
            sum_to_f64(&offset.abs()?)?
        );
    }

    let output_diff = xent_output
        .broadcast_mul(&scale)?
        .broadcast_add(&offset)?
        .sub(nnet_output)?;
    let l2_term = -0.5 * scale_coeff * sum_to_f64(&output_diff.sqr()?)?;
    if let Some(deriv) = nnet_output_deriv {
        accumulate(deriv, &output_diff.affine(scale_coeff, 0.)?)?;
    }
    if let Some(deriv) = xent_output_deriv {
        accumulate(
            deriv,
            &output_diff.broadcast_mul(&scale)?.affine(-scale_coeff, 0.)?,
        )?;
    }
    Ok(l2_term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validate() {
        assert!(ChainTrainingOptions::default().validate().is_ok());
        let bad = [
            ChainTrainingOptions {
                l2_regularize: -1e-4,
                ..Default::default()
            },
            ChainTrainingOptions {
                leaky_hmm_coefficient: 1.0,
                ..Default::default()
            },
            ChainTrainingOptions {
                leaky_hmm_coefficient: -0.1,
                ..Default::default()
            },
            ChainTrainingOptions {
                max_alpha_beta_error: 0.0,
                ..Default::default()
            },
            ChainTrainingOptions {
                default_objf_per_frame: f64::NAN,
                ..Default::default()
            },
        ];
        for opts in bad.iter() {
            assert!(opts.validate().is_err(), "{opts:?}");
        }
    }

    #[test]
    fn test_options_from_json() -> Result<()> {
        let opts = ChainTrainingOptions::from_json(r#"{"l2_regularize": 5e-5}"#)?;
        assert_eq!(opts.l2_regularize, 5e-5);
        assert_eq!(opts.leaky_hmm_coefficient, 1e-5);
        assert_eq!(opts.default_objf_per_frame, -10.0);
        assert!(ChainTrainingOptions::from_json(r#"{"leaky_hmm_coefficient": 2.0}"#).is_err());
        Ok(())
    }
}

//! Chain (lattice-free MMI) training objective for candle.
//!
//! The objective for a minibatch is the log-likelihood of the network output under each
//! sequence's numerator graph, minus the log-likelihood under a shared denominator graph:
//!
//! | Term | Graph | Computed |
//! |------|-------|----------|
//! | numerator | one small [`Graph`] per sequence | on the host, in f64 |
//! | denominator | one large [`DenominatorGraph`] shared by the batch | on the output's device |
//!
//! Both are forward-backward passes over arc-emitting graphs, where every transition consumes
//! one frame and reads the output column of its pdf-id. The derivative of the objective
//! w.r.t. the output is the numerator occupation minus the denominator occupation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle::{Device, Tensor};
//! use candle_chain::{
//!     compute_chain_objf_and_deriv, ChainTrainingOptions, DenominatorGraph, Graph, Supervision,
//! };
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let den_graph = DenominatorGraph::new(Arc::new(Graph::load("den.fst")?), 3000, &device)?;
//! let supervision = Supervision::new(1.0, 50, vec![Arc::new(Graph::load("num.fst")?)])?;
//! let nnet_output = Tensor::randn(0f32, 1., (50, 3000), &device)?;
//! let mut deriv = nnet_output.zeros_like()?;
//! let objf = compute_chain_objf_and_deriv(
//!     &ChainTrainingOptions::default(),
//!     &den_graph,
//!     &supervision,
//!     &nnet_output,
//!     None,
//!     Some(&mut deriv),
//!     None,
//! )?;
//! println!("objf per frame {}", objf.objf_per_frame());
//! # Ok(())
//! # }
//! ```

pub mod denominator;
pub mod graph;
pub mod numerator;
pub mod ops;
pub mod supervision;
pub mod training;

pub use denominator::{DenominatorComputation, DenominatorGraph};
pub use graph::{Graph, Transition};
pub use numerator::NumeratorComputation;
pub use supervision::Supervision;
pub use training::{compute_chain_objf_and_deriv, ChainObjective, ChainTrainingOptions};

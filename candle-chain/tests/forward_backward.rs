#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod common;

use std::sync::Arc;

use candle::{test_device, DType, Device, Result, Tensor};
use candle_chain::{
    ChainTrainingOptions, DenominatorComputation, DenominatorGraph, Graph, NumeratorComputation,
    Supervision, Transition,
};
use common::{random_den_graph, random_tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn den_alpha_beta_consistency(dev: &Device) -> Result<()> {
    let (num_sequences, num_frames, num_pdfs) = (3, 40, 7);
    let opts = ChainTrainingOptions::default();
    for seed in 0..5 {
        let mut rng = StdRng::seed_from_u64(seed);
        let graph = random_den_graph(&mut rng, 12, num_pdfs)?;
        let den_graph = DenominatorGraph::new(Arc::new(graph), num_pdfs, dev)?;
        let nnet_output = random_tensor(
            &mut rng,
            num_sequences * num_frames,
            num_pdfs,
            4.0,
            DType::F32,
            dev,
        )?;
        let mut den = DenominatorComputation::new(&opts, &den_graph, num_sequences, &nnet_output)?;
        let total = den.forward()?;
        let mut deriv = nnet_output.zeros_like()?;
        assert!(den.backward(1.0, &mut deriv)?);

        let totals = den
            .log_likelihoods()
            .unwrap()
            .flatten_all()?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        assert_eq!(totals.len(), num_sequences);
        let sum: f64 = totals.iter().sum();
        assert!((sum - total).abs() < 1e-4 * total.abs());

        let frames = den
            .frame_log_likelihoods()
            .unwrap()
            .to_dtype(DType::F64)?
            .to_vec2::<f64>()?;
        assert_eq!(frames.len(), num_frames + 1);
        for (t, row) in frames.iter().enumerate() {
            for (s, v) in row.iter().enumerate() {
                assert!(
                    (v - totals[s]).abs() <= 1e-4 * totals[s].abs().max(1.0),
                    "seed {seed} frame {t} sequence {s}: {v} vs {}",
                    totals[s]
                );
            }
        }
        for t in 0..=num_frames {
            assert_eq!(den.alpha(t).unwrap().dims(), [num_sequences, 12]);
        }
        assert!(den.alpha(num_frames + 1).is_none());
    }
    Ok(())
}

/// Two frames through `0 -pdf0-> 1` followed by the self-loop `1 -pdf1-> 1`, with all the
/// initial mass on state 0. With leak `c`, the total is
/// `ln(1 + c) + a0 + ln(c * exp(b0) + exp(b1))` where `a`/`b` are the two output rows.
fn den_leaky_closed_form(dev: &Device) -> Result<()> {
    let graph = Graph::new(
        2,
        &[(0, 0.0)],
        &[(1, 0.0)],
        vec![Transition::new(0, 1, 0, 0.0), Transition::new(1, 1, 1, 0.0)],
    )?;
    let den_graph = DenominatorGraph::new(Arc::new(graph), 2, dev)?;
    let (a0, b0, b1) = (0.3f64, -0.7f64, 1.2f64);
    let nnet_output = Tensor::new(&[[a0 as f32, -2.0], [b0 as f32, b1 as f32]], dev)?;
    for c in [0.0, 0.1, 0.5] {
        let opts = ChainTrainingOptions {
            leaky_hmm_coefficient: c,
            ..Default::default()
        };
        let mut den = DenominatorComputation::new(&opts, &den_graph, 1, &nnet_output)?;
        let total = den.forward()?;
        let expected = (1.0 + c).ln() + a0 + (c * b0.exp() + b1.exp()).ln();
        assert!((total - expected).abs() < 1e-5, "c = {c}: {total} vs {expected}");

        let mut deriv = nnet_output.zeros_like()?;
        assert!(den.backward(1.0, &mut deriv)?);
        let deriv = deriv.to_dtype(DType::F64)?.to_vec2::<f64>()?;
        // frame 0 always takes the arc on pdf 0; frame 1 splits between the two arcs
        assert!((deriv[0][0] - 1.0).abs() < 1e-5);
        assert!(deriv[0][1].abs() < 1e-6);
        let p0 = c * b0.exp() / (c * b0.exp() + b1.exp());
        assert!((deriv[1][0] - p0).abs() < 1e-5, "{deriv:?}");
        assert!((deriv[1][1] - (1.0 - p0)).abs() < 1e-5, "{deriv:?}");
    }
    Ok(())
}

fn den_from_start_state(dev: &Device) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(99);
    let num_pdfs = 5;
    let graph = random_den_graph(&mut rng, 8, num_pdfs)?;
    let den_graph = DenominatorGraph::from_start_state(&graph, 0, num_pdfs, dev)?;
    let probs = den_graph.initial_probs();
    assert_eq!(probs.len(), 8);
    assert!(probs.iter().all(|&p| p >= 0.0));
    assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    assert_eq!(den_graph.num_states(), 8);
    assert_eq!(den_graph.num_pdfs(), num_pdfs);
    assert_eq!(den_graph.graph().num_transitions(), graph.num_transitions());
    assert!(den_graph.device().same_device(dev));

    let nnet_output = random_tensor(&mut rng, 2 * 6, num_pdfs, 1.0, DType::F32, dev)?;
    let opts = ChainTrainingOptions::default();
    let mut den = DenominatorComputation::new(&opts, &den_graph, 2, &nnet_output)?;
    assert!(den.forward()?.is_finite());
    Ok(())
}

/// Backward before forward is a usage error, not a numerical failure.
fn den_backward_requires_forward(dev: &Device) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(1);
    let den_graph = DenominatorGraph::new(Arc::new(random_den_graph(&mut rng, 4, 3)?), 3, dev)?;
    let nnet_output = random_tensor(&mut rng, 6, 3, 1.0, DType::F32, dev)?;
    let opts = ChainTrainingOptions::default();
    let mut den = DenominatorComputation::new(&opts, &den_graph, 2, &nnet_output)?;
    let mut deriv = nnet_output.zeros_like()?;
    assert!(den.backward(1.0, &mut deriv).is_err());
    assert!(DenominatorComputation::new(&opts, &den_graph, 4, &nnet_output).is_err());
    Ok(())
}

#[test]
fn num_alpha_beta_consistency() -> Result<()> {
    let dev = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(12);
    let num_pdfs = 6;
    let graphs = (0..3)
        .map(|_| random_den_graph(&mut rng, 5, num_pdfs).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let supervision = Supervision::new(1.0, 30, graphs)?;
    let nnet_output = random_tensor(
        &mut rng,
        supervision.num_rows(),
        num_pdfs,
        3.0,
        DType::F32,
        &dev,
    )?;
    let mut num = NumeratorComputation::new(&supervision, &nnet_output)?;
    let total = num.forward()?;
    let mut deriv = nnet_output.zeros_like()?;
    num.backward(&mut deriv)?;
    let sum: f64 = num.log_likelihoods().iter().sum();
    assert!((sum - total).abs() < 1e-9 * total.abs());
    for s in 0..3 {
        let expected = num.log_likelihoods()[s];
        let frames = num.frame_log_likelihoods(s);
        assert_eq!(frames.len(), 31);
        for v in frames {
            assert!((v - expected).abs() < 1e-9 * expected.abs().max(1.0));
        }
    }
    // one unit of posterior mass per frame
    let row_sums = deriv.sum(1)?.to_vec1::<f32>()?;
    for v in row_sums {
        assert!((v - 1.0).abs() < 1e-5);
    }
    Ok(())
}

test_device!(
    den_alpha_beta_consistency,
    den_alpha_beta_consistency_cpu,
    den_alpha_beta_consistency_gpu,
    den_alpha_beta_consistency_metal
);
test_device!(
    den_leaky_closed_form,
    den_leaky_closed_form_cpu,
    den_leaky_closed_form_gpu,
    den_leaky_closed_form_metal
);
test_device!(
    den_from_start_state,
    den_from_start_state_cpu,
    den_from_start_state_gpu,
    den_from_start_state_metal
);
test_device!(
    den_backward_requires_forward,
    den_backward_requires_forward_cpu,
    den_backward_requires_forward_gpu,
    den_backward_requires_forward_metal
);

//! Forward engine against the reference engine, plus causality, segment
//! isolation and layout invariance. All CPU-only.

use candle_core::{DType, Device, Tensor};
use causal_conv_core::conv::{
    causal_conv1d_fn, causal_conv1d_ref, Activation, CausalConv1dArgs,
};
use causal_conv_core::testing::{max_abs_diff, random_seq_idx, random_tensor};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const BATCH: usize = 2;
const DIM: usize = 6;
const SEQLEN: usize = 17;

struct Inputs {
    x: Tensor,
    weight: Tensor,
    bias: Tensor,
    state: Tensor,
    seq_idx: Tensor,
}

fn inputs(width: usize, state_len: usize, dtype: DType, seed: u64) -> Inputs {
    Inputs {
        x: random_tensor((BATCH, DIM, SEQLEN), dtype, seed).unwrap(),
        weight: random_tensor((DIM, width), dtype, seed + 1).unwrap(),
        bias: random_tensor(DIM, dtype, seed + 2).unwrap(),
        state: random_tensor((BATCH, DIM, state_len), dtype, seed + 3).unwrap(),
        seq_idx: random_seq_idx(BATCH, SEQLEN, 4, seed + 4).unwrap(),
    }
}

fn args(inp: &Inputs, bias: bool, state: bool, seq: bool, act: Activation) -> CausalConv1dArgs {
    CausalConv1dArgs {
        bias: bias.then(|| inp.bias.clone()),
        initial_state: state.then(|| inp.state.clone()),
        seq_idx: seq.then(|| inp.seq_idx.clone()),
        activation: act,
        out: None,
    }
}

fn reference(x: &Tensor, weight: &Tensor, args: &CausalConv1dArgs) -> Tensor {
    causal_conv1d_ref(
        x,
        weight,
        args.bias.as_ref(),
        args.initial_state.as_ref(),
        args.seq_idx.as_ref(),
        args.activation,
    )
    .unwrap()
}

// ─── Reference equivalence ───────────────────────────────────────────────────

#[test]
fn test_forward_matches_reference_grid() {
    let mut seed = 0;
    for width in 2..=4 {
        for state_len in [0, 1, width - 1, 6] {
            let inp = inputs(width, state_len, DType::F32, seed);
            seed += 10;
            for bias in [false, true] {
                for state in [false, true] {
                    for seq in [false, true] {
                        for act in [Activation::None, Activation::Silu] {
                            let args = args(&inp, bias, state, seq, act);
                            let out = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();
                            let expected = reference(&inp.x, &inp.weight, &args);
                            let diff = max_abs_diff(&out, &expected).unwrap();
                            assert!(
                                diff < 1e-5,
                                "width={width} state_len={state_len} bias={bias} \
                                 state={state} seq={seq} act={act}: diff {diff}"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn test_forward_matches_reference_f64() {
    let inp = inputs(4, 3, DType::F64, 99);
    let args = args(&inp, true, true, true, Activation::Silu);
    let out = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();
    let expected = reference(&inp.x, &inp.weight, &args);
    assert!(max_abs_diff(&out, &expected).unwrap() < 1e-12);
}

#[test]
fn test_half_precision_signals() {
    for dtype in [DType::F16, DType::BF16] {
        let x = random_tensor((BATCH, DIM, SEQLEN), dtype, 5).unwrap();
        let weight = random_tensor((DIM, 4), DType::F32, 6).unwrap();
        let args = CausalConv1dArgs::new().with_activation(Activation::Silu);
        let out = causal_conv1d_fn(&x, &weight, &args).unwrap();
        assert_eq!(out.dtype(), dtype);

        let expected = reference(&x, &weight, &args);
        let tol = if dtype == DType::F16 { 1e-2 } else { 5e-2 };
        assert!(max_abs_diff(&out, &expected).unwrap() < tol, "{dtype:?}");
    }
}

// ─── Causality and segments ──────────────────────────────────────────────────

#[test]
fn test_future_perturbation_does_not_leak() {
    let inp = inputs(4, 2, DType::F32, 7);
    let args = args(&inp, true, true, false, Activation::Silu);
    let base = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();

    for t in [0, 5, SEQLEN - 2] {
        let rest = SEQLEN - t - 1;
        let keep = inp.x.narrow(2, 0, t + 1).unwrap();
        let noise = random_tensor((BATCH, DIM, rest), DType::F32, 100 + t as u64).unwrap();
        let future = (inp.x.narrow(2, t + 1, rest).unwrap() + noise).unwrap();
        let perturbed = Tensor::cat(&[&keep, &future], 2).unwrap();
        let out = causal_conv1d_fn(&perturbed, &inp.weight, &args).unwrap();
        let diff = max_abs_diff(
            &out.narrow(2, 0, t + 1).unwrap(),
            &base.narrow(2, 0, t + 1).unwrap(),
        )
        .unwrap();
        assert_eq!(diff, 0.0, "prefix up to t={t} changed");
    }
}

#[test]
fn test_segment_start_ignores_earlier_history() {
    let inp = inputs(4, 3, DType::F32, 11);
    // One batch row, boundary at t = 6.
    let seq: Vec<i64> = (0..SEQLEN).map(|t| if t < 6 { 0 } else { 1 }).collect();
    let seq_idx = Tensor::from_vec(seq, (1, SEQLEN), &Device::Cpu).unwrap();
    let x = inp.x.narrow(0, 0, 1).unwrap();
    let state = inp.state.narrow(0, 0, 1).unwrap();
    let args = CausalConv1dArgs::new()
        .with_initial_state(state)
        .with_seq_idx(seq_idx)
        .with_bias(inp.bias.clone());
    let out = causal_conv1d_fn(&x, &inp.weight, &args).unwrap();

    // Zero everything before the boundary, state included.
    let zeros = Tensor::zeros((1, DIM, 6), DType::F32, &Device::Cpu).unwrap();
    let x_zeroed = Tensor::cat(&[&zeros, &x.narrow(2, 6, SEQLEN - 6).unwrap()], 2).unwrap();
    let args_zeroed = CausalConv1dArgs::new().with_bias(inp.bias.clone());
    let out_zeroed = causal_conv1d_fn(&x_zeroed, &inp.weight, &args_zeroed).unwrap();

    let diff = max_abs_diff(
        &out.narrow(2, 6, SEQLEN - 6).unwrap(),
        &out_zeroed.narrow(2, 6, SEQLEN - 6).unwrap(),
    )
    .unwrap();
    assert!(diff < 1e-6, "segment 1 saw segment 0 history: {diff}");
}

#[test]
fn test_state_is_masked_outside_first_segment() {
    // Every timestep starts a new segment: only the current tap survives.
    let x = Tensor::new(&[[[1.0f32, 2.0, 3.0]]], &Device::Cpu).unwrap();
    let w = Tensor::new(&[[5.0f32, 7.0, 11.0]], &Device::Cpu).unwrap();
    let state = Tensor::new(&[[[100.0f32, 200.0]]], &Device::Cpu).unwrap();
    let seq = Tensor::new(&[[0u8, 1, 2]], &Device::Cpu).unwrap();
    let args = CausalConv1dArgs::new()
        .with_initial_state(state)
        .with_seq_idx(seq);
    let out = causal_conv1d_fn(&x, &w, &args).unwrap();
    assert_eq!(
        out.to_vec3::<f32>().unwrap(),
        vec![vec![vec![5.0 * 100.0 + 7.0 * 200.0 + 11.0, 22.0, 33.0]]]
    );
}

#[test]
fn test_every_integer_seq_idx_dtype() {
    let inp = inputs(3, 2, DType::F32, 13);
    let seq = inp.seq_idx.clone();
    let expected = causal_conv1d_fn(
        &inp.x,
        &inp.weight,
        &CausalConv1dArgs::new()
            .with_initial_state(inp.state.clone())
            .with_seq_idx(seq.clone()),
    )
    .unwrap();

    for dtype in [DType::U8, DType::U32, DType::I16, DType::I32] {
        let args = CausalConv1dArgs::new()
            .with_initial_state(inp.state.clone())
            .with_seq_idx(seq.to_dtype(dtype).unwrap());
        let out = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();
        assert_eq!(max_abs_diff(&out, &expected).unwrap(), 0.0, "{dtype:?}");

        let reference = reference(&inp.x, &inp.weight, &args);
        assert!(max_abs_diff(&out, &reference).unwrap() < 1e-5, "{dtype:?}");
    }
}

// ─── Layouts ─────────────────────────────────────────────────────────────────

#[test]
fn test_channel_last_signal_matches_contiguous() {
    let inp = inputs(3, 2, DType::F32, 21);
    let args = args(&inp, true, true, true, Activation::Silu);
    let expected = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();

    let x_cl = inp
        .x
        .transpose(1, 2)
        .unwrap()
        .contiguous()
        .unwrap()
        .transpose(1, 2)
        .unwrap();
    assert!(!x_cl.is_contiguous());
    let out = causal_conv1d_fn(&x_cl, &inp.weight, &args).unwrap();
    assert_eq!(max_abs_diff(&out, &expected).unwrap(), 0.0);
}

#[test]
fn test_permuted_signal_matches_contiguous() {
    let inp = inputs(4, 0, DType::F32, 31);
    let args = args(&inp, true, false, false, Activation::None);
    let expected = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();

    // (L, D, B) storage viewed as (B, D, L): no unit-stride time or channel axis.
    let x_perm = inp
        .x
        .permute((2, 1, 0))
        .unwrap()
        .contiguous()
        .unwrap()
        .permute((2, 1, 0))
        .unwrap();
    let out = causal_conv1d_fn(&x_perm, &inp.weight, &args).unwrap();
    assert_eq!(max_abs_diff(&out, &expected).unwrap(), 0.0);
}

#[test]
fn test_narrowed_signal_view() {
    let inp = inputs(4, 0, DType::F32, 41);
    let view = inp.x.narrow(2, 3, 10).unwrap();
    let args = CausalConv1dArgs::new();
    let out = causal_conv1d_fn(&view, &inp.weight, &args).unwrap();
    let expected = causal_conv1d_fn(&view.contiguous().unwrap(), &inp.weight, &args).unwrap();
    assert_eq!(max_abs_diff(&out, &expected).unwrap(), 0.0);
}

// ─── Activation fusion ───────────────────────────────────────────────────────

#[test]
fn test_fused_silu_equals_separate_silu() {
    let inp = inputs(4, 2, DType::F32, 51);
    let plain = args(&inp, true, true, false, Activation::None);
    let fused = args(&inp, true, true, false, Activation::Silu);

    let separate = candle_nn::ops::silu(&causal_conv1d_fn(&inp.x, &inp.weight, &plain).unwrap())
        .unwrap();
    let out = causal_conv1d_fn(&inp.x, &inp.weight, &fused).unwrap();
    assert!(max_abs_diff(&out, &separate).unwrap() < 1e-6);
}

// ─── Output buffer ───────────────────────────────────────────────────────────

#[test]
fn test_preallocated_output_is_filled() {
    let inp = inputs(2, 0, DType::F32, 61);
    let buf = Tensor::zeros((BATCH, DIM, SEQLEN), DType::F32, &Device::Cpu).unwrap();
    let args = CausalConv1dArgs::new().with_out(buf.clone());
    let out = causal_conv1d_fn(&inp.x, &inp.weight, &args).unwrap();

    let expected = causal_conv1d_fn(&inp.x, &inp.weight, &CausalConv1dArgs::new()).unwrap();
    assert_eq!(max_abs_diff(&buf, &expected).unwrap(), 0.0);
    assert_eq!(max_abs_diff(&out, &expected).unwrap(), 0.0);
}

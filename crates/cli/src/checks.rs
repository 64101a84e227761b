//! Differential, streaming and gradient checks run by `causal-conv`.

use std::fmt;

use candle_core::{DType, Tensor};
use causal_conv_core::conv::{
    causal_conv1d_bwd, causal_conv1d_fn, causal_conv1d_fwd, causal_conv1d_ref,
    causal_conv1d_update, causal_conv1d_update_ref, tail_state, CausalConv1dArgs, ConvState,
    Result,
};
use causal_conv_core::testing::{max_abs_diff, numerical_grad, random_seq_idx, random_tensor};
use tracing::debug;

use crate::config::CheckParams;

/// Central-difference step for the gradient check.
const GRADCHECK_EPS: f64 = 1e-6;
/// Tolerance of the `f64` gradient check.
pub const GRADCHECK_TOLERANCE: f64 = 1e-6;

/// Outcome of a single comparison.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub name: &'static str,
    pub max_abs_diff: f64,
    pub tolerance: f64,
}

impl CheckReport {
    fn new(name: &'static str, max_abs_diff: f64, tolerance: f64) -> Self {
        debug!(check = name, max_abs_diff, tolerance, "compared");
        Self {
            name,
            max_abs_diff,
            tolerance,
        }
    }

    pub fn passed(&self) -> bool {
        self.max_abs_diff <= self.tolerance
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} max_abs_diff={:.3e} tolerance={:.1e} {}",
            self.name,
            self.max_abs_diff,
            self.tolerance,
            if self.passed() { "ok" } else { "FAILED" }
        )
    }
}

/// Random inputs of one problem instance.
#[derive(Debug, Clone)]
pub struct Problem {
    pub x: Tensor,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub initial_state: Option<Tensor>,
    pub seq_idx: Option<Tensor>,
}

/// Half-precision signals keep `f32` parameters, so the reference engine
/// does not accumulate in half precision.
fn param_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        other => other,
    }
}

impl Problem {
    pub fn random(p: &CheckParams, dtype: DType, with_segments: bool) -> Result<Self> {
        let pdt = param_dtype(dtype);
        let seed = p.seed;
        Ok(Self {
            x: random_tensor((p.batch, p.dim, p.seqlen), dtype, seed)?,
            weight: random_tensor((p.dim, p.width), pdt, seed + 1)?,
            bias: p
                .bias
                .then(|| random_tensor(p.dim, pdt, seed + 2))
                .transpose()?,
            initial_state: (p.state_len > 0)
                .then(|| random_tensor((p.batch, p.dim, p.state_len), pdt, seed + 3))
                .transpose()?,
            seq_idx: (with_segments && p.segments > 1)
                .then(|| random_seq_idx(p.batch, p.seqlen, p.segments, seed + 4))
                .transpose()?,
        })
    }

    pub fn args(&self, p: &CheckParams) -> CausalConv1dArgs {
        CausalConv1dArgs {
            bias: self.bias.clone(),
            initial_state: self.initial_state.clone(),
            seq_idx: self.seq_idx.clone(),
            activation: p.activation,
            out: None,
        }
    }

    fn reference(&self, x: &Tensor, p: &CheckParams) -> Result<Tensor> {
        Ok(causal_conv1d_ref(
            x,
            &self.weight,
            self.bias.as_ref(),
            self.initial_state.as_ref(),
            self.seq_idx.as_ref(),
            p.activation,
        )?)
    }
}

/// Fused engine against the reference engine, for contiguous and
/// channel-last signals and for one streaming step.
pub fn run_check(p: &CheckParams) -> Result<Vec<CheckReport>> {
    let problem = Problem::random(p, p.dtype, true)?;
    let args = problem.args(p);
    let expected = problem.reference(&problem.x, p)?;

    let out = causal_conv1d_fn(&problem.x, &problem.weight, &args)?;
    let mut reports = vec![CheckReport::new(
        "forward",
        max_abs_diff(&out, &expected)?,
        p.tolerance,
    )];

    let x_cl = problem.x.transpose(1, 2)?.contiguous()?.transpose(1, 2)?;
    let out_cl = causal_conv1d_fn(&x_cl, &problem.weight, &args)?;
    reports.push(CheckReport::new(
        "forward_channel_last",
        max_abs_diff(&out_cl, &expected)?,
        p.tolerance,
    ));

    let pdt = param_dtype(p.dtype);
    let x_t = random_tensor((p.batch, p.dim), p.dtype, p.seed + 5)?;
    let state = random_tensor((p.batch, p.dim, p.width), pdt, p.seed + 6)?;
    let mut fused_state = state.copy()?;
    let mut ref_state = state.copy()?;
    let out = causal_conv1d_update(
        &x_t,
        &mut fused_state,
        &problem.weight,
        problem.bias.as_ref(),
        p.activation,
    )?;
    let expected = causal_conv1d_update_ref(
        &x_t,
        &mut ref_state,
        &problem.weight,
        problem.bias.as_ref(),
        p.activation,
    )?;
    reports.push(CheckReport::new(
        "update",
        max_abs_diff(&out, &expected)?.max(max_abs_diff(&fused_state, &ref_state)?),
        p.tolerance,
    ));
    Ok(reports)
}

/// Streaming decode and chunked prefill against a one-shot forward.
pub fn run_stream(p: &CheckParams) -> Result<Vec<CheckReport>> {
    let problem = Problem::random(p, p.dtype, false)?;
    let args = problem.args(p);
    let full = causal_conv1d_fn(&problem.x, &problem.weight, &args)?;

    let head = problem.x.narrow(2, 0, p.prefill)?;
    let rest = p.seqlen - p.prefill;

    let mut state = ConvState::from_prefill(&head, problem.initial_state.as_ref(), p.width)?;
    let mut stream_diff: f64 = 0.0;
    for t in p.prefill..p.seqlen {
        let x_t = problem.x.narrow(2, t, 1)?.squeeze(2)?;
        let y_t = state.step(&x_t, &problem.weight, problem.bias.as_ref(), p.activation)?;
        let expected = full.narrow(2, t, 1)?.squeeze(2)?;
        stream_diff = stream_diff.max(max_abs_diff(&y_t, &expected)?);
    }

    let first = causal_conv1d_fn(&head, &problem.weight, &args)?;
    let carry = tail_state(&head, problem.initial_state.as_ref(), p.width - 1)?;
    let second_args = CausalConv1dArgs {
        initial_state: Some(carry),
        ..args
    };
    let second = causal_conv1d_fn(
        &problem.x.narrow(2, p.prefill, rest)?,
        &problem.weight,
        &second_args,
    )?;
    let chunked = Tensor::cat(&[&first, &second], 2)?;

    Ok(vec![
        CheckReport::new("stream", stream_diff, p.tolerance),
        CheckReport::new("chunked", max_abs_diff(&chunked, &full)?, p.tolerance),
    ])
}

/// Backward engine against central finite differences, in `f64`.
pub fn run_gradcheck(p: &CheckParams) -> Result<Vec<CheckReport>> {
    let problem = Problem::random(p, DType::F64, true)?;
    let args = problem.args(p);
    let dout = random_tensor((p.batch, p.dim, p.seqlen), DType::F64, p.seed + 7)?;

    let (_, checkpoint) = causal_conv1d_fwd(&problem.x, &problem.weight, &args)?;
    let grads = causal_conv1d_bwd(&checkpoint, &dout, None)?;

    let numeric_dx = numerical_grad(
        |x| causal_conv1d_fn(x, &problem.weight, &args),
        &problem.x,
        &dout,
        GRADCHECK_EPS,
    )?;
    let numeric_dw = numerical_grad(
        |w| causal_conv1d_fn(&problem.x, w, &args),
        &problem.weight,
        &dout,
        GRADCHECK_EPS,
    )?;
    let mut reports = vec![
        CheckReport::new(
            "grad_x",
            max_abs_diff(&grads.dx, &numeric_dx)?,
            GRADCHECK_TOLERANCE,
        ),
        CheckReport::new(
            "grad_weight",
            max_abs_diff(&grads.dweight, &numeric_dw)?,
            GRADCHECK_TOLERANCE,
        ),
    ];

    if let (Some(bias), Some(dbias)) = (&problem.bias, &grads.dbias) {
        let numeric = numerical_grad(
            |b| {
                let args = CausalConv1dArgs {
                    bias: Some(b.clone()),
                    ..args.clone()
                };
                causal_conv1d_fn(&problem.x, &problem.weight, &args)
            },
            bias,
            &dout,
            GRADCHECK_EPS,
        )?;
        reports.push(CheckReport::new(
            "grad_bias",
            max_abs_diff(dbias, &numeric)?,
            GRADCHECK_TOLERANCE,
        ));
    }

    if let (Some(state), Some(dstate)) = (&problem.initial_state, &grads.dinitial_state) {
        let numeric = numerical_grad(
            |s| {
                let args = CausalConv1dArgs {
                    initial_state: Some(s.clone()),
                    ..args.clone()
                };
                causal_conv1d_fn(&problem.x, &problem.weight, &args)
            },
            state,
            &dout,
            GRADCHECK_EPS,
        )?;
        reports.push(CheckReport::new(
            "grad_initial_state",
            max_abs_diff(dstate, &numeric)?,
            GRADCHECK_TOLERANCE,
        ));
    }
    Ok(reports)
}

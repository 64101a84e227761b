//! Single-step streaming update over a rolling `(batch, dim, width)` state.

use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp2, Layout, Shape, Tensor, WithDType};
use rayon::prelude::*;
use tracing::debug;

use super::activation::Activation;
use super::error::Result;
use super::layout::{self, to_f64_vec, Strided2, Strided3};
use super::window::{self, load_taps, MAX_WIDTH};

struct CausalConv1dUpdateOp {
    batch: usize,
    dim: usize,
    width: usize,
    weight: Vec<f64>,
    bias: Option<Vec<f64>>,
    activation: Activation,
}

impl CausalConv1dUpdateOp {
    /// Returns `[out (B*D) | new_state (B*D*W)]` in `f64`.
    fn run<X: WithDType, S: WithDType>(
        &self,
        x: &[X],
        x_layout: &Layout,
        state: &[S],
        state_layout: &Layout,
    ) -> Vec<f64> {
        let (dim, width) = (self.dim, self.width);
        let xv = Strided2::from_layout(x_layout);
        let sv = Strided3::from_layout(state_layout);

        let rows: Vec<(f64, [f64; MAX_WIDTH])> = (0..self.batch * dim)
            .into_par_iter()
            .map(|row| {
                let (b, d) = (row / dim, row % dim);
                let mut window = [0.0; MAX_WIDTH];
                for (k, slot) in window.iter_mut().enumerate().take(width - 1) {
                    *slot = state[sv.at(b, d, k + 1)].to_f64();
                }
                window[width - 1] = x[xv.at(b, d)].to_f64();

                let taps = load_taps(&self.weight, d, width);
                let mut acc: f64 = (0..width).map(|k| taps[k] * window[k]).sum();
                if let Some(bias) = &self.bias {
                    acc += bias[d];
                }
                (self.activation.apply(acc), window)
            })
            .collect();

        let mut packed = Vec::with_capacity(rows.len() * (1 + width));
        packed.extend(rows.iter().map(|(out, _)| *out));
        for (_, window) in &rows {
            packed.extend_from_slice(&window[..width]);
        }
        packed
    }
}

macro_rules! dispatch_state {
    ($self:ident, $x:ident, $l1:ident, $s2:ident, $l2:ident) => {
        match $s2 {
            CpuStorage::F32(s) => $self.run($x, $l1, s, $l2),
            CpuStorage::F64(s) => $self.run($x, $l1, s, $l2),
            CpuStorage::F16(s) => $self.run($x, $l1, s, $l2),
            CpuStorage::BF16(s) => $self.run($x, $l1, s, $l2),
            other => candle_core::bail!(
                "causal_conv1d_update: unsupported state dtype {:?}",
                other.dtype()
            ),
        }
    };
}

impl CustomOp2 for CausalConv1dUpdateOp {
    fn name(&self) -> &'static str {
        "causal_conv1d_update"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let packed = match s1 {
            CpuStorage::F32(x) => dispatch_state!(self, x, l1, s2, l2),
            CpuStorage::F64(x) => dispatch_state!(self, x, l1, s2, l2),
            CpuStorage::F16(x) => dispatch_state!(self, x, l1, s2, l2),
            CpuStorage::BF16(x) => dispatch_state!(self, x, l1, s2, l2),
            other => candle_core::bail!(
                "causal_conv1d_update: unsupported input dtype {:?}",
                other.dtype()
            ),
        };
        let shape = Shape::from_dims(&[packed.len()]);
        Ok((CpuStorage::F64(packed), shape))
    }
}

/// Advance `conv_state` by one timestep and return that timestep's output.
///
/// `x` is `(batch, dim)`, `conv_state` exactly `(batch, dim, width)` holding
/// the most recent inputs oldest first, `weight` `(dim, width)`. The state is
/// shifted left and `x` lands in the last slot. The output is the dot product
/// of the window with the filter, plus bias, through the activation, in
/// `x`'s dtype.
///
/// The new state is written only after both results are computed. A
/// contiguous state is updated in its own storage, so every handle to it
/// observes the step; any other layout has its handle replaced.
pub fn causal_conv1d_update(
    x: &Tensor,
    conv_state: &mut Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    activation: Activation,
) -> Result<Tensor> {
    let (batch, dim) = window::dims2("x", x)?;
    let width = window::check_weight(weight, dim)?;
    window::check_bias(bias, dim)?;
    window::expect_dims("conv_state", conv_state, &[batch, dim, width])?;
    debug!(
        batch,
        dim,
        width,
        bias = bias.is_some(),
        activation = %activation,
        "causal_conv1d update"
    );

    let op = CausalConv1dUpdateOp {
        batch,
        dim,
        width,
        weight: to_f64_vec(weight)?,
        bias: bias.map(to_f64_vec).transpose()?,
        activation,
    };
    let packed =
        layout::to_cpu(x)?.apply_op2_no_bwd(&layout::to_cpu(conv_state)?, &op)?;
    let rows = batch * dim;
    let out = packed
        .narrow(0, 0, rows)?
        .reshape((batch, dim))?
        .to_dtype(x.dtype())?
        .to_device(x.device())?;
    let new_state = packed
        .narrow(0, rows, rows * width)?
        .reshape((batch, dim, width))?
        .to_dtype(conv_state.dtype())?;

    if conv_state.is_contiguous() {
        layout::write_into("conv_state", conv_state, &new_state)?;
    } else {
        *conv_state = new_state.to_device(conv_state.device())?;
    }
    Ok(out)
}

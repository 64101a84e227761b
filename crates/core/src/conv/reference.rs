//! Reference engine built from generic tensor primitives.
//!
//! Slow but obviously correct: the state is concatenated explicitly and the
//! convolution goes through candle's grouped `conv1d`. Used to cross-check
//! the fused kernels.

use candle_core::{bail, DType, Result, Tensor};

use super::activation::Activation;
use super::window::{MAX_WIDTH, MIN_WIDTH};

fn filter_width(weight: &Tensor) -> Result<(usize, usize)> {
    let (dim, width) = weight.dims2()?;
    if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
        bail!("filter width {width} is not supported (expected {MIN_WIDTH}..={MAX_WIDTH})");
    }
    Ok((dim, width))
}

fn finish(out: Tensor, bias: Option<&Tensor>, activation: Activation) -> Result<Tensor> {
    let out = match bias {
        Some(bias) => {
            let dim = bias.dim(0)?;
            out.broadcast_add(&bias.to_dtype(out.dtype())?.reshape((1, dim, 1))?)?
        }
        None => out,
    };
    if activation.is_enabled() {
        candle_nn::ops::silu(&out)
    } else {
        Ok(out)
    }
}

/// Shifted-window sum with a segment-equality mask per tap.
fn masked_windows(
    src: &Tensor,
    weight: &Tensor,
    seq_idx: &Tensor,
    state_len: usize,
    seqlen: usize,
) -> Result<Tensor> {
    let (batch, dim, _) = src.dims3()?;
    let (_, width) = weight.dims2()?;

    let pad = Tensor::zeros((batch, dim, width - 1), src.dtype(), src.device())?;
    let padded = Tensor::cat(&[&pad, src], 2)?;

    // Padding and state positions share the segment of timestep 0.
    let seq = seq_idx.to_dtype(DType::I64)?;
    let head = seq.narrow(1, 0, 1)?.repeat((1, width - 1 + state_len))?;
    let seq_padded = Tensor::cat(&[&head, &seq], 1)?;

    let mut out = Tensor::zeros((batch, dim, seqlen), src.dtype(), src.device())?;
    for k in 0..width {
        let window = padded.narrow(2, state_len + k, seqlen)?;
        let mask = seq_padded
            .narrow(1, state_len + k, seqlen)?
            .eq(&seq)?
            .to_dtype(src.dtype())?
            .unsqueeze(1)?;
        let tap = weight.narrow(1, k, 1)?.reshape((1, dim, 1))?;
        out = (out + window.broadcast_mul(&mask)?.broadcast_mul(&tap)?)?;
    }
    Ok(out)
}

/// Reference for [`causal_conv1d_fn`](super::causal_conv1d_fn).
///
/// Computes in the filter's dtype and casts the result back to `x`'s dtype.
pub fn causal_conv1d_ref(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    initial_state: Option<&Tensor>,
    seq_idx: Option<&Tensor>,
    activation: Activation,
) -> Result<Tensor> {
    let dtype_in = x.dtype();
    let x = x.to_dtype(weight.dtype())?;
    let (dim, width) = filter_width(weight)?;
    let (_, _, seqlen) = x.dims3()?;

    let (src, state_len) = match initial_state {
        Some(state) => (
            Tensor::cat(&[&state.to_dtype(x.dtype())?, &x], 2)?,
            state.dim(2)?,
        ),
        None => (x, 0),
    };

    let out = match seq_idx {
        Some(seq_idx) => masked_windows(&src, weight, seq_idx, state_len, seqlen)?,
        None => {
            let kernel = weight.unsqueeze(1)?;
            src.contiguous()?
                .conv1d(&kernel, width - 1, 1, 1, dim)?
                .narrow(2, state_len, seqlen)?
        }
    };
    finish(out, bias, activation)?.to_dtype(dtype_in)
}

/// Reference for [`causal_conv1d_update`](super::causal_conv1d_update):
/// explicit roll, elementwise product and sum over the window axis.
pub fn causal_conv1d_update_ref(
    x: &Tensor,
    conv_state: &mut Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    activation: Activation,
) -> Result<Tensor> {
    let dtype_in = x.dtype();
    let (_, width) = filter_width(weight)?;
    let (batch, dim) = x.dims2()?;
    if conv_state.dims() != [batch, dim, width] {
        bail!(
            "conv_state: expected shape [{batch}, {dim}, {width}], got {:?}",
            conv_state.dims()
        );
    }

    let x = x.to_dtype(conv_state.dtype())?.unsqueeze(2)?;
    let rolled = Tensor::cat(&[&conv_state.narrow(2, 1, width - 1)?, &x], 2)?;
    let out = rolled
        .to_dtype(weight.dtype())?
        .broadcast_mul(&weight.unsqueeze(0)?)?
        .sum(2)?
        .unsqueeze(2)?;
    *conv_state = rolled;

    finish(out, bias, activation)?.squeeze(2)?.to_dtype(dtype_in)
}

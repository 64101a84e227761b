//! Rolling convolution state for chunked prefill and streaming decode.
//!
//! A full-sequence call reads its history from an optional initial state; a
//! streaming call keeps the most recent `width` inputs per channel. Both are
//! derived from the same logical sequence `[initial_state | x]`:
//!
//! - [`tail_state`] extracts its last `len` samples, to hand to the next chunk;
//! - [`ConvState::from_prefill`] seeds the streaming buffer the same way.

use candle_core::{DType, Device, Tensor};

use super::activation::Activation;
use super::error::{ConvError, Result};
use super::update::causal_conv1d_update;
use super::window;

/// Last `len` samples of `[initial_state | x]` along time, zero-padded on the
/// left when fewer are available.
///
/// `x` is `(batch, dim, seqlen)`; the optional state `(batch, dim, state_len)`
/// is cast to `x`'s dtype. The result is a contiguous `(batch, dim, len)`
/// tensor, suitable as the initial state of the following chunk.
pub fn tail_state(x: &Tensor, initial_state: Option<&Tensor>, len: usize) -> Result<Tensor> {
    let (batch, dim, _) = window::dims3("x", x)?;
    let src = match initial_state {
        Some(state) => {
            let (sb, sd, state_len) = window::dims3("initial_state", state)?;
            if sb != batch || sd != dim {
                return Err(ConvError::ShapeMismatch {
                    tensor: "initial_state",
                    expected: vec![batch, dim, state_len],
                    got: state.dims().to_vec(),
                });
            }
            Tensor::cat(&[&state.to_dtype(x.dtype())?, x], 2)?
        }
        None => x.clone(),
    };

    let available = src.dim(2)?;
    let tail = if available >= len {
        src.narrow(2, available - len, len)?
    } else {
        let pad = Tensor::zeros((batch, dim, len - available), x.dtype(), x.device())?;
        Tensor::cat(&[&pad, &src], 2)?
    };
    Ok(tail.contiguous()?)
}

/// Owned `(batch, dim, width)` rolling buffer for streaming decode.
#[derive(Debug, Clone)]
pub struct ConvState {
    tensor: Tensor,
}

impl ConvState {
    /// Zero history, as at the start of a fresh sequence.
    pub fn zeros(
        batch: usize,
        dim: usize,
        width: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let tensor = Tensor::zeros((batch, dim, width), dtype, device)?;
        Ok(Self { tensor })
    }

    /// Seed the buffer from a prefilled chunk so decoding continues where a
    /// full-sequence forward over `x` (with `initial_state`) stopped.
    pub fn from_prefill(x: &Tensor, initial_state: Option<&Tensor>, width: usize) -> Result<Self> {
        Ok(Self {
            tensor: tail_state(x, initial_state, width)?,
        })
    }

    /// Wrap an existing `(batch, dim, width)` buffer.
    pub fn from_tensor(tensor: Tensor) -> Result<Self> {
        window::dims3("conv_state", &tensor)?;
        Ok(Self { tensor })
    }

    /// Reset to zeros, keeping shape, dtype and device.
    pub fn reset(&mut self) -> Result<()> {
        let dims = self.tensor.dims().to_vec();
        let dtype = self.tensor.dtype();
        let device = self.tensor.device().clone();
        self.tensor = Tensor::zeros(dims.as_slice(), dtype, &device)?;
        Ok(())
    }

    /// Feed one `(batch, dim)` timestep and return its output.
    pub fn step(
        &mut self,
        x: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        activation: Activation,
    ) -> Result<Tensor> {
        causal_conv1d_update(x, &mut self.tensor, weight, bias, activation)
    }

    pub fn width(&self) -> usize {
        self.tensor.dims().last().copied().unwrap_or(0)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }
}

//! Full-sequence forward engine.

use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp1, Layout, Shape, Tensor, WithDType};
use rayon::prelude::*;
use tracing::debug;

use super::activation::Activation;
use super::args::CausalConv1dArgs;
use super::error::Result;
use super::layout::{self, Strided3};
use super::window::{self, ConvParams};

/// Tensors saved by the forward pass for the backward pass.
///
/// Holds cheap handles to the caller's tensors; the pre-activation is not
/// stored and is recomputed in backward. With `seq_idx` set, the initial
/// state belongs to the first segment of each row (see
/// [`CausalConv1dArgs::seq_idx`]).
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub(crate) x: Tensor,
    pub(crate) weight: Tensor,
    pub(crate) bias: Option<Tensor>,
    pub(crate) initial_state: Option<Tensor>,
    pub(crate) seq_idx: Option<Tensor>,
    pub(crate) activation: Activation,
}

impl Checkpoint {
    /// `(batch, dim, seqlen)` of the saved signal.
    pub fn shape(&self) -> &[usize] {
        self.x.dims()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn has_initial_state(&self) -> bool {
        self.initial_state.is_some()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

struct CausalConv1dFwdOp {
    params: ConvParams,
}

impl CausalConv1dFwdOp {
    fn run<T: WithDType>(&self, x: &[T], layout: &Layout) -> Vec<T> {
        let g = self.params.geom;
        let view = Strided3::from_layout(layout);
        let mut out = vec![T::from_f64(0.0); g.rows() * g.seqlen];
        if g.seqlen == 0 {
            return out;
        }
        let act = self.params.activation;
        out.par_chunks_mut(g.seqlen)
            .enumerate()
            .for_each(|(row, out_row)| {
                let (b, d) = (row / g.dim, row % g.dim);
                let mut y = vec![0.0; g.seqlen];
                self.params
                    .preact_row(b, d, |t| x[view.at(b, d, t)].to_f64(), &mut y);
                for (o, &v) in out_row.iter_mut().zip(&y) {
                    *o = T::from_f64(act.apply(v));
                }
            });
        out
    }
}

impl CustomOp1 for CausalConv1dFwdOp {
    fn name(&self) -> &'static str {
        "causal_conv1d_fwd"
    }

    fn cpu_fwd(
        &self,
        storage: &CpuStorage,
        layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let g = self.params.geom;
        let shape = Shape::from_dims(&[g.batch, g.dim, g.seqlen]);
        let out = match storage {
            CpuStorage::F32(x) => CpuStorage::F32(self.run(x, layout)),
            CpuStorage::F64(x) => CpuStorage::F64(self.run(x, layout)),
            CpuStorage::F16(x) => CpuStorage::F16(self.run(x, layout)),
            CpuStorage::BF16(x) => CpuStorage::BF16(self.run(x, layout)),
            other => candle_core::bail!(
                "causal_conv1d_fwd: unsupported signal dtype {:?}",
                other.dtype()
            ),
        };
        Ok((out, shape))
    }
}

/// Forward pass on an already normalised signal.
fn forward_impl(x: &Tensor, weight: &Tensor, args: &CausalConv1dArgs) -> Result<Tensor> {
    let geom = window::validate(
        x,
        weight,
        args.bias.as_ref(),
        args.initial_state.as_ref(),
        args.seq_idx.as_ref(),
    )?;
    if let Some(out) = &args.out {
        layout::check_buffer("out", out, x.dims(), x.dtype())?;
    }
    debug!(
        batch = geom.batch,
        dim = geom.dim,
        seqlen = geom.seqlen,
        width = geom.width,
        state_len = geom.state_len,
        bias = args.bias.is_some(),
        seq_idx = args.seq_idx.is_some(),
        activation = %args.activation,
        "causal_conv1d forward"
    );

    let params = ConvParams::new(
        geom,
        weight,
        args.bias.as_ref(),
        args.initial_state.as_ref(),
        args.seq_idx.as_ref(),
        args.activation,
    )?;
    let out = layout::to_cpu(x)?
        .apply_op1_no_bwd(&CausalConv1dFwdOp { params })?
        .to_device(x.device())?;

    match &args.out {
        Some(buf) => layout::write_into("out", buf, &out),
        None => Ok(out),
    }
}

/// Causal depthwise conv1d over a full sequence.
///
/// `x` is `(batch, dim, seqlen)` in any layout whose time or channel axis is
/// unit-stride (other layouts are made contiguous first), `weight` is
/// `(dim, width)` with `width` in `2..=4`. The output has the signal's dtype.
pub fn causal_conv1d_fn(x: &Tensor, weight: &Tensor, args: &CausalConv1dArgs) -> Result<Tensor> {
    Ok(causal_conv1d_fwd(x, weight, args)?.0)
}

/// Like [`causal_conv1d_fn`], additionally returning the [`Checkpoint`]
/// consumed by [`causal_conv1d_bwd`](super::causal_conv1d_bwd).
pub fn causal_conv1d_fwd(
    x: &Tensor,
    weight: &Tensor,
    args: &CausalConv1dArgs,
) -> Result<(Tensor, Checkpoint)> {
    window::dims3("x", x)?;
    let x = layout::normalize("x", x)?;
    let out = forward_impl(&x, weight, args)?;
    let checkpoint = Checkpoint {
        x,
        weight: weight.clone(),
        bias: args.bias.clone(),
        initial_state: args.initial_state.clone(),
        seq_idx: args.seq_idx.clone(),
        activation: args.activation,
    };
    Ok((out, checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::ConvError;
    use candle_core::{DType, Device};

    fn t3(data: &[f32], shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn identity_filter_passes_signal_through() {
        let x = t3(&[1.0, 2.0, 3.0, 4.0], (1, 1, 4));
        let w = Tensor::new(&[[0.0f32, 0.0, 1.0]], &Device::Cpu).unwrap();
        let out = causal_conv1d_fn(&x, &w, &CausalConv1dArgs::new()).unwrap();
        assert_eq!(out.to_vec3::<f32>().unwrap(), vec![vec![vec![1.0, 2.0, 3.0, 4.0]]]);
    }

    #[test]
    fn oldest_tap_reads_past_samples() {
        let x = t3(&[1.0, 2.0, 3.0, 4.0], (1, 1, 4));
        let w = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        let out = causal_conv1d_fn(&x, &w, &CausalConv1dArgs::new()).unwrap();
        assert_eq!(out.to_vec3::<f32>().unwrap(), vec![vec![vec![0.0, 1.0, 2.0, 3.0]]]);
    }

    #[test]
    fn bias_and_state_feed_the_window() {
        let x = t3(&[1.0, 2.0, 3.0], (1, 1, 3));
        let w = Tensor::new(&[[1.0f32, 1.0, 1.0]], &Device::Cpu).unwrap();
        let state = t3(&[10.0, 20.0], (1, 1, 2));
        let bias = Tensor::new(&[0.5f32], &Device::Cpu).unwrap();
        let args = CausalConv1dArgs::new()
            .with_bias(bias)
            .with_initial_state(state);
        let out = causal_conv1d_fn(&x, &w, &args).unwrap();
        assert_eq!(
            out.to_vec3::<f32>().unwrap(),
            vec![vec![vec![31.5, 23.5, 6.5]]]
        );
    }

    #[test]
    fn silu_is_applied_after_bias() {
        let x = t3(&[1.0], (1, 1, 1));
        let w = Tensor::new(&[[0.0f32, 1.0]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[-1.0f32], &Device::Cpu).unwrap();
        let args = CausalConv1dArgs::new()
            .with_bias(bias)
            .with_activation(Activation::Silu);
        let out = causal_conv1d_fn(&x, &w, &args).unwrap();
        // silu(1 - 1) = 0
        assert_eq!(out.to_vec3::<f32>().unwrap(), vec![vec![vec![0.0]]]);
    }

    #[test]
    fn writes_into_caller_buffer() {
        let x = t3(&[1.0, 2.0], (1, 1, 2));
        let w = Tensor::new(&[[0.0f32, 2.0]], &Device::Cpu).unwrap();
        let buf = Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let args = CausalConv1dArgs::new().with_out(buf.clone());
        causal_conv1d_fn(&x, &w, &args).unwrap();
        assert_eq!(buf.to_vec3::<f32>().unwrap(), vec![vec![vec![2.0, 4.0]]]);
    }

    #[test]
    fn rejects_out_buffer_with_wrong_dtype() {
        let x = t3(&[1.0, 2.0], (1, 1, 2));
        let w = Tensor::new(&[[0.0f32, 2.0]], &Device::Cpu).unwrap();
        let buf = Tensor::zeros((1, 1, 2), DType::F64, &Device::Cpu).unwrap();
        let args = CausalConv1dArgs::new().with_out(buf);
        assert!(matches!(
            causal_conv1d_fn(&x, &w, &args),
            Err(ConvError::DTypeMismatch { tensor: "out", .. })
        ));
    }

    #[test]
    fn empty_sequence_yields_empty_output() {
        let x = Tensor::zeros((2, 3, 0), DType::F32, &Device::Cpu).unwrap();
        let w = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let out = causal_conv1d_fn(&x, &w, &CausalConv1dArgs::new()).unwrap();
        assert_eq!(out.dims(), &[2, 3, 0]);
    }

    #[test]
    fn half_precision_signal_keeps_dtype() {
        let x = t3(&[1.0, 2.0, 3.0], (1, 1, 3)).to_dtype(DType::BF16).unwrap();
        let w = Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap();
        let out = causal_conv1d_fn(&x, &w, &CausalConv1dArgs::new()).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
        let vals = out.to_dtype(DType::F32).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(vals, vec![vec![vec![1.0, 3.0, 5.0]]]);
    }
}

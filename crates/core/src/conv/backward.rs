//! Backward engine: adjoint of the causal sliding-window sum.
//!
//! Each `(b, d)` row produces its own signal and state gradients plus partial
//! filter/bias gradients. The partials are then reduced over the batch axis
//! in index order, so results do not depend on rayon's scheduling.

use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp2, DType, Layout, Shape, Tensor, WithDType};
use rayon::prelude::*;
use tracing::debug;

use super::error::Result;
use super::forward::Checkpoint;
use super::layout::{self, Strided3};
use super::window::{self, ConvParams, Geometry, Source, MAX_WIDTH};

/// Gradients produced by [`causal_conv1d_bwd`].
#[derive(Debug, Clone)]
pub struct Gradients {
    /// `(batch, dim, seqlen)`, in the signal's dtype.
    pub dx: Tensor,
    /// `(dim, width)`, in the filter's dtype.
    pub dweight: Tensor,
    /// `(dim,)`; present only when the forward pass had a bias.
    pub dbias: Option<Tensor>,
    /// `(batch, dim, state_len)`; present only when the forward pass had an
    /// initial state.
    pub dinitial_state: Option<Tensor>,
}

struct RowGrad {
    dx: Vec<f64>,
    dweight: [f64; MAX_WIDTH],
    dbias: f64,
    dstate: Vec<f64>,
}

struct CausalConv1dBwdOp {
    params: ConvParams,
}

impl CausalConv1dBwdOp {
    fn row<X: WithDType, G: WithDType>(
        &self,
        b: usize,
        d: usize,
        x: (&[X], Strided3),
        dout: (&[G], Strided3),
    ) -> RowGrad {
        let p = &self.params;
        let g = p.geom;
        let xv = |t: usize| x.0[x.1.at(b, d, t)].to_f64();

        let mut dy: Vec<f64> = (0..g.seqlen)
            .map(|t| dout.0[dout.1.at(b, d, t)].to_f64())
            .collect();
        if p.activation.is_enabled() {
            let mut y = vec![0.0; g.seqlen];
            p.preact_row(b, d, &xv, &mut y);
            for (dy, &y) in dy.iter_mut().zip(&y) {
                *dy *= p.activation.grad(y);
            }
        }

        let taps = p.taps(d);
        let mut grad = RowGrad {
            dx: vec![0.0; g.seqlen],
            dweight: [0.0; MAX_WIDTH],
            dbias: 0.0,
            dstate: vec![0.0; g.state_len],
        };
        for (t, &dy_t) in dy.iter().enumerate() {
            grad.dbias += dy_t;
            for (k, &w) in taps.iter().enumerate().take(g.width) {
                match p.source(b, t, k) {
                    Source::Signal(s) => {
                        grad.dweight[k] += xv(s) * dy_t;
                        grad.dx[s] += w * dy_t;
                    }
                    Source::State(slot) => {
                        grad.dweight[k] += p.state_at(b, d, slot) * dy_t;
                        grad.dstate[slot] += w * dy_t;
                    }
                    Source::Zero => {}
                }
            }
        }
        grad
    }

    fn run<X: WithDType, G: WithDType>(
        &self,
        x: &[X],
        x_layout: &Layout,
        dout: &[G],
        dout_layout: &Layout,
    ) -> Vec<f64> {
        let g = self.params.geom;
        let xs = (x, Strided3::from_layout(x_layout));
        let gs = (dout, Strided3::from_layout(dout_layout));
        let rows: Vec<RowGrad> = (0..g.rows())
            .into_par_iter()
            .map(|row| self.row(row / g.dim, row % g.dim, xs, gs))
            .collect();
        pack(&g, &rows)
    }
}

/// Pack `[dx | dweight | dbias | dstate]` into one flat buffer.
fn pack(g: &Geometry, rows: &[RowGrad]) -> Vec<f64> {
    let mut packed = Vec::with_capacity(packed_len(g));
    for r in rows {
        packed.extend_from_slice(&r.dx);
    }
    for d in 0..g.dim {
        for k in 0..g.width {
            packed.push((0..g.batch).map(|b| rows[b * g.dim + d].dweight[k]).sum());
        }
    }
    for d in 0..g.dim {
        packed.push((0..g.batch).map(|b| rows[b * g.dim + d].dbias).sum());
    }
    for r in rows {
        packed.extend_from_slice(&r.dstate);
    }
    packed
}

fn packed_len(g: &Geometry) -> usize {
    g.rows() * g.seqlen + g.dim * g.width + g.dim + g.rows() * g.state_len
}

macro_rules! dispatch_dout {
    ($self:ident, $x:ident, $l1:ident, $s2:ident, $l2:ident) => {
        match $s2 {
            CpuStorage::F32(dout) => $self.run($x, $l1, dout, $l2),
            CpuStorage::F64(dout) => $self.run($x, $l1, dout, $l2),
            CpuStorage::F16(dout) => $self.run($x, $l1, dout, $l2),
            CpuStorage::BF16(dout) => $self.run($x, $l1, dout, $l2),
            other => candle_core::bail!(
                "causal_conv1d_bwd: unsupported gradient dtype {:?}",
                other.dtype()
            ),
        }
    };
}

impl CustomOp2 for CausalConv1dBwdOp {
    fn name(&self) -> &'static str {
        "causal_conv1d_bwd"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let packed = match s1 {
            CpuStorage::F32(x) => dispatch_dout!(self, x, l1, s2, l2),
            CpuStorage::F64(x) => dispatch_dout!(self, x, l1, s2, l2),
            CpuStorage::F16(x) => dispatch_dout!(self, x, l1, s2, l2),
            CpuStorage::BF16(x) => dispatch_dout!(self, x, l1, s2, l2),
            other => candle_core::bail!(
                "causal_conv1d_bwd: unsupported signal dtype {:?}",
                other.dtype()
            ),
        };
        let shape = Shape::from_dims(&[packed.len()]);
        Ok((CpuStorage::F64(packed), shape))
    }
}

/// Gradients of the forward pass recorded in `checkpoint`, given the output
/// gradient `dout` (`(batch, dim, seqlen)`, any supported layout).
///
/// `dx_out`, if given, receives the signal gradient and is returned as
/// [`Gradients::dx`]; it follows the same rules as the forward output buffer.
pub fn causal_conv1d_bwd(
    checkpoint: &Checkpoint,
    dout: &Tensor,
    dx_out: Option<&Tensor>,
) -> Result<Gradients> {
    let x = &checkpoint.x;
    let geom = window::validate(
        x,
        &checkpoint.weight,
        checkpoint.bias.as_ref(),
        checkpoint.initial_state.as_ref(),
        checkpoint.seq_idx.as_ref(),
    )?;
    window::expect_dims("dout", dout, x.dims())?;
    if let Some(buf) = dx_out {
        layout::check_buffer("dx", buf, x.dims(), x.dtype())?;
    }
    debug!(
        batch = geom.batch,
        dim = geom.dim,
        seqlen = geom.seqlen,
        width = geom.width,
        state_len = geom.state_len,
        bias = checkpoint.bias.is_some(),
        seq_idx = checkpoint.seq_idx.is_some(),
        activation = %checkpoint.activation,
        "causal_conv1d backward"
    );

    let dout = layout::normalize("dout", dout)?;
    let params = ConvParams::new(
        geom,
        &checkpoint.weight,
        checkpoint.bias.as_ref(),
        checkpoint.initial_state.as_ref(),
        checkpoint.seq_idx.as_ref(),
        checkpoint.activation,
    )?;
    let packed = layout::to_cpu(x)?
        .apply_op2_no_bwd(&layout::to_cpu(&dout)?, &CausalConv1dBwdOp { params })?;

    let Geometry {
        batch,
        dim,
        seqlen,
        width,
        state_len,
    } = geom;
    let mut offset = 0;
    let mut take = |len: usize| {
        let part = packed.narrow(0, offset, len);
        offset += len;
        part
    };
    let dx = take(batch * dim * seqlen)?.reshape((batch, dim, seqlen))?;
    let dweight = take(dim * width)?.reshape((dim, width))?;
    let dbias = take(dim)?;
    let dstate = take(batch * dim * state_len)?.reshape((batch, dim, state_len))?;

    let dx = cast_like(&dx, x)?;
    let dx = match dx_out {
        Some(buf) => layout::write_into("dx", buf, &dx)?,
        None => dx,
    };
    Ok(Gradients {
        dx,
        dweight: cast_like(&dweight, &checkpoint.weight)?,
        dbias: checkpoint
            .bias
            .as_ref()
            .map(|b| cast_like(&dbias, b))
            .transpose()?,
        dinitial_state: checkpoint
            .initial_state
            .as_ref()
            .map(|s| cast_like(&dstate, s))
            .transpose()?,
    })
}

/// Cast an `f64` gradient to the dtype and device of the tensor it
/// differentiates.
fn cast_like(grad: &Tensor, like: &Tensor) -> Result<Tensor> {
    debug_assert_eq!(grad.dtype(), DType::F64);
    Ok(grad.to_dtype(like.dtype())?.to_device(like.device())?)
}

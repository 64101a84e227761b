//! Causal window shared by the forward and backward kernels.
//!
//! Output position `t` reads tap `k` from `src[t - (W - 1) + k]`, where
//! `src` is the initial state (if any) followed by the signal. The state is
//! never concatenated: [`ConvParams::source`] resolves each tap to a signal
//! index, a state index, or a zero (left padding / segment boundary).

use candle_core::Tensor;

use super::activation::Activation;
use super::error::{ConvError, Result};
use super::layout::{seq_idx_vec, to_f64_vec};

pub(crate) const MIN_WIDTH: usize = 2;
pub(crate) const MAX_WIDTH: usize = 4;

/// Per-channel filter taps, sized for the widest supported filter.
pub(crate) type Taps = [f64; MAX_WIDTH];

/// Problem geometry of one forward/backward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub batch: usize,
    pub dim: usize,
    pub seqlen: usize,
    pub width: usize,
    /// Width of the initial state, 0 when absent.
    pub state_len: usize,
}

impl Geometry {
    pub(crate) fn rows(&self) -> usize {
        self.batch * self.dim
    }
}

pub(crate) fn dims3(name: &'static str, t: &Tensor) -> Result<(usize, usize, usize)> {
    match *t.dims() {
        [a, b, c] => Ok((a, b, c)),
        _ => Err(ConvError::Rank {
            tensor: name,
            expected: 3,
            got: t.dims().to_vec(),
        }),
    }
}

pub(crate) fn dims2(name: &'static str, t: &Tensor) -> Result<(usize, usize)> {
    match *t.dims() {
        [a, b] => Ok((a, b)),
        _ => Err(ConvError::Rank {
            tensor: name,
            expected: 2,
            got: t.dims().to_vec(),
        }),
    }
}

pub(crate) fn expect_dims(name: &'static str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(ConvError::ShapeMismatch {
            tensor: name,
            expected: expected.to_vec(),
            got: t.dims().to_vec(),
        });
    }
    Ok(())
}

/// Validate a `(dim, width)` filter against the signal's channel count.
pub(crate) fn check_weight(weight: &Tensor, dim: usize) -> Result<usize> {
    let (w_dim, width) = dims2("weight", weight)?;
    if w_dim != dim {
        return Err(ConvError::ShapeMismatch {
            tensor: "weight",
            expected: vec![dim, width],
            got: weight.dims().to_vec(),
        });
    }
    if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
        return Err(ConvError::UnsupportedWidth(width));
    }
    Ok(width)
}

pub(crate) fn check_bias(bias: Option<&Tensor>, dim: usize) -> Result<()> {
    match bias {
        Some(b) => expect_dims("bias", b, &[dim]),
        None => Ok(()),
    }
}

/// Validate every input of a full-sequence call and derive its geometry.
pub(crate) fn validate(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    initial_state: Option<&Tensor>,
    seq_idx: Option<&Tensor>,
) -> Result<Geometry> {
    let (batch, dim, seqlen) = dims3("x", x)?;
    let width = check_weight(weight, dim)?;
    check_bias(bias, dim)?;

    let state_len = match initial_state {
        Some(state) => {
            let (sb, sd, len) = dims3("initial_state", state)?;
            if sb != batch || sd != dim {
                return Err(ConvError::ShapeMismatch {
                    tensor: "initial_state",
                    expected: vec![batch, dim, len],
                    got: state.dims().to_vec(),
                });
            }
            len
        }
        None => 0,
    };

    if let Some(seq_idx) = seq_idx {
        expect_dims("seq_idx", seq_idx, &[batch, seqlen])?;
        if !seq_idx.dtype().is_int() {
            return Err(ConvError::SegmentIndexDType(seq_idx.dtype()));
        }
    }

    Ok(Geometry {
        batch,
        dim,
        seqlen,
        width,
        state_len,
    })
}

/// Load channel `d`'s taps from a flattened `(dim, width)` filter.
#[inline]
pub(crate) fn load_taps(weight: &[f64], d: usize, width: usize) -> Taps {
    let mut taps = [0.0; MAX_WIDTH];
    taps[..width].copy_from_slice(&weight[d * width..(d + 1) * width]);
    taps
}

/// What a tap reads for a given output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// Signal timestep.
    Signal(usize),
    /// Slot of the initial state.
    State(usize),
    /// Left padding or a different segment.
    Zero,
}

/// Host-side copies of the small operands, shared by the kernels.
#[derive(Debug, Clone)]
pub(crate) struct ConvParams {
    pub geom: Geometry,
    pub weight: Vec<f64>,
    pub bias: Option<Vec<f64>>,
    pub state: Option<Vec<f64>>,
    pub seq_idx: Option<Vec<i64>>,
    pub activation: Activation,
}

impl ConvParams {
    pub(crate) fn new(
        geom: Geometry,
        weight: &Tensor,
        bias: Option<&Tensor>,
        initial_state: Option<&Tensor>,
        seq_idx: Option<&Tensor>,
        activation: Activation,
    ) -> Result<Self> {
        Ok(Self {
            geom,
            weight: to_f64_vec(weight)?,
            bias: bias.map(to_f64_vec).transpose()?,
            state: initial_state.map(to_f64_vec).transpose()?,
            seq_idx: seq_idx.map(seq_idx_vec).transpose()?,
            activation,
        })
    }

    #[inline]
    pub(crate) fn taps(&self, d: usize) -> Taps {
        load_taps(&self.weight, d, self.geom.width)
    }

    #[inline]
    pub(crate) fn bias(&self, d: usize) -> f64 {
        self.bias.as_ref().map_or(0.0, |b| b[d])
    }

    fn segments(&self, b: usize) -> Option<&[i64]> {
        let len = self.geom.seqlen;
        self.seq_idx.as_deref().map(|s| &s[b * len..(b + 1) * len])
    }

    #[inline]
    pub(crate) fn state_at(&self, b: usize, d: usize, slot: usize) -> f64 {
        match &self.state {
            Some(state) => {
                let g = &self.geom;
                state[(b * g.dim + d) * g.state_len + slot]
            }
            None => 0.0,
        }
    }

    /// Resolve tap `k` of output position `t` in batch row `b`.
    ///
    /// State slots count as part of the segment of timestep 0.
    #[inline]
    pub(crate) fn source(&self, b: usize, t: usize, k: usize) -> Source {
        let back = self.geom.width - 1 - k;
        let segments = self.segments(b);
        if back <= t {
            let s = t - back;
            match segments {
                Some(seg) if seg[s] != seg[t] => Source::Zero,
                _ => Source::Signal(s),
            }
        } else {
            let before = back - t;
            if before > self.geom.state_len {
                return Source::Zero;
            }
            match segments {
                Some(seg) if seg[0] != seg[t] => Source::Zero,
                _ => Source::State(self.geom.state_len - before),
            }
        }
    }

    /// Pre-activation output of row `(b, d)`, written into `out[..seqlen]`.
    pub(crate) fn preact_row(&self, b: usize, d: usize, x: impl Fn(usize) -> f64, out: &mut [f64]) {
        let taps = self.taps(d);
        let bias = self.bias(d);
        for (t, o) in out.iter_mut().enumerate().take(self.geom.seqlen) {
            let mut acc = 0.0;
            for (k, &w) in taps.iter().enumerate().take(self.geom.width) {
                acc += w * match self.source(b, t, k) {
                    Source::Signal(s) => x(s),
                    Source::State(slot) => self.state_at(b, d, slot),
                    Source::Zero => 0.0,
                };
            }
            *o = acc + bias;
        }
    }
}

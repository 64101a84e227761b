//! Tensor layout handling shared by the kernels.
//!
//! The kernels read signals through their strides, so both the channel-first
//! `(B, D, L)` contiguous layout and the channel-last layout (a `(B, L, D)`
//! buffer transposed to `(B, D, L)`) are consumed without a copy. Any other
//! stride pattern goes through [`normalize`] first.

use candle_core::{DType, Device, Layout, Tensor};
use tracing::{debug, trace};

use super::error::{ConvError, Result};

/// Element offsets of a rank-3 view into a flat storage buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Strided3 {
    offset: usize,
    strides: [usize; 3],
}

impl Strided3 {
    pub(crate) fn from_layout(layout: &Layout) -> Self {
        let s = layout.stride();
        Self {
            offset: layout.start_offset(),
            strides: [s[0], s[1], s[2]],
        }
    }

    #[inline]
    pub(crate) fn at(&self, i: usize, j: usize, k: usize) -> usize {
        self.offset + i * self.strides[0] + j * self.strides[1] + k * self.strides[2]
    }
}

/// Element offsets of a rank-2 view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Strided2 {
    offset: usize,
    strides: [usize; 2],
}

impl Strided2 {
    pub(crate) fn from_layout(layout: &Layout) -> Self {
        let s = layout.stride();
        Self {
            offset: layout.start_offset(),
            strides: [s[0], s[1]],
        }
    }

    #[inline]
    pub(crate) fn at(&self, i: usize, j: usize) -> usize {
        self.offset + i * self.strides[0] + j * self.strides[1]
    }
}

/// Returns `true` when the kernels can read `t` (rank 3) in place: either
/// the time axis or the channel axis has unit stride.
pub fn is_supported(t: &Tensor) -> bool {
    let stride = t.stride();
    stride.len() == 3 && (stride[2] == 1 || stride[1] == 1)
}

/// Explicit contiguity step applied to signals whose layout the kernels do
/// not read directly. Supported layouts are returned as-is (a cheap handle
/// clone).
pub fn normalize(name: &'static str, t: &Tensor) -> Result<Tensor> {
    if is_supported(t) {
        return Ok(t.clone());
    }
    debug!(
        tensor = name,
        stride = ?t.stride(),
        "neither time nor channel axis is unit-stride, making contiguous"
    );
    Ok(t.contiguous()?)
}

/// Flatten a small auxiliary tensor (weight, bias, state) to `f64`.
pub(crate) fn to_f64_vec(t: &Tensor) -> Result<Vec<f64>> {
    Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
}

/// Flatten a segment index of any integer dtype to `i64`.
pub(crate) fn seq_idx_vec(t: &Tensor) -> Result<Vec<i64>> {
    if !t.dtype().is_int() {
        return Err(ConvError::SegmentIndexDType(t.dtype()));
    }
    Ok(t.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?)
}

/// Move a tensor to the CPU for the CPU kernels.
pub(crate) fn to_cpu(t: &Tensor) -> Result<Tensor> {
    if t.device().is_cpu() {
        return Ok(t.clone());
    }
    trace!(device = ?t.device(), "copying tensor to cpu for the conv kernels");
    Ok(t.to_device(&Device::Cpu)?)
}

/// Check a caller-provided output buffer against the tensor it will receive.
pub(crate) fn check_buffer(
    name: &'static str,
    buf: &Tensor,
    dims: &[usize],
    dtype: DType,
) -> Result<()> {
    if buf.dims() != dims {
        return Err(ConvError::ShapeMismatch {
            tensor: name,
            expected: dims.to_vec(),
            got: buf.dims().to_vec(),
        });
    }
    if buf.dtype() != dtype {
        return Err(ConvError::DTypeMismatch {
            tensor: name,
            expected: dtype,
            got: buf.dtype(),
        });
    }
    if !buf.is_contiguous() {
        return Err(ConvError::NonContiguous { tensor: name });
    }
    Ok(())
}

/// Write `src` into the caller-provided buffer `dst` and return `dst`.
///
/// `dst` must be contiguous, with the same shape and dtype as `src`.
pub(crate) fn write_into(name: &'static str, dst: &Tensor, src: &Tensor) -> Result<Tensor> {
    check_buffer(name, dst, src.dims(), src.dtype())?;
    let src = src.to_device(dst.device())?.contiguous()?;
    dst.slice_set(&src, 0, 0)?;
    Ok(dst.clone())
}

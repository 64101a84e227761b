//! Error taxonomy for the causal conv1d engine.
//!
//! Every failure is raised before any data is touched, so an `Err` never
//! comes with a partially written output or a half-advanced state buffer.

use candle_core::DType;
use thiserror::Error;

/// Engine result type.
pub type Result<T> = std::result::Result<T, ConvError>;

/// Coarse classification of a [`ConvError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unsupported option (e.g. an unknown activation identifier).
    Configuration,
    /// Rank, shape, width or dtype mismatch among the inputs.
    Shape,
    /// Backward invoked without a recorded forward checkpoint.
    State,
    /// Failure inside candle itself.
    Backend,
}

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("unsupported activation '{0}': expected none, silu or swish")]
    UnsupportedActivation(String),

    #[error("{tensor}: expected a {expected}-d tensor, got shape {got:?}")]
    Rank {
        tensor: &'static str,
        expected: usize,
        got: Vec<usize>,
    },

    #[error("{tensor}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("filter width {0} is not supported (expected 2..=4)")]
    UnsupportedWidth(usize),

    #[error("seq_idx must have an integer dtype, got {0:?}")]
    SegmentIndexDType(DType),

    #[error("{tensor}: dtype {got:?} does not match {expected:?}")]
    DTypeMismatch {
        tensor: &'static str,
        expected: DType,
        got: DType,
    },

    #[error("{tensor}: caller-provided buffer must be contiguous")]
    NonContiguous { tensor: &'static str },

    #[error("backward called without a saved forward checkpoint")]
    MissingCheckpoint,

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl ConvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedActivation(_) => ErrorKind::Configuration,
            Self::Rank { .. }
            | Self::ShapeMismatch { .. }
            | Self::UnsupportedWidth(_)
            | Self::SegmentIndexDType(_)
            | Self::DTypeMismatch { .. }
            | Self::NonContiguous { .. } => ErrorKind::Shape,
            Self::MissingCheckpoint => ErrorKind::State,
            Self::Candle(_) => ErrorKind::Backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            ConvError::UnsupportedActivation("gelu".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(ConvError::UnsupportedWidth(7).kind(), ErrorKind::Shape);
        assert_eq!(
            ConvError::SegmentIndexDType(DType::F32).kind(),
            ErrorKind::Shape
        );
        assert_eq!(
            ConvError::NonContiguous { tensor: "out" }.kind(),
            ErrorKind::Shape
        );
        assert_eq!(ConvError::MissingCheckpoint.kind(), ErrorKind::State);
    }

    #[test]
    fn shape_mismatch_message_names_tensor() {
        let err = ConvError::ShapeMismatch {
            tensor: "bias",
            expected: vec![8],
            got: vec![4],
        };
        assert_eq!(err.to_string(), "bias: expected shape [8], got [4]");
    }
}

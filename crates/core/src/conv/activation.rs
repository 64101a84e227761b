//! Fused activation applied after the bias add.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{ConvError, Result};

/// Activation fused into the convolution kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Identity.
    #[default]
    None,
    /// SiLU / swish: `y * sigmoid(y)`.
    #[serde(alias = "swish")]
    Silu,
}

impl Activation {
    /// Parse an optional activation identifier.
    ///
    /// `None` selects the identity; `"silu"` and `"swish"` select SiLU.
    /// Anything else is a configuration error.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(Self::None),
            Some("silu") | Some("swish") => Ok(Self::Silu),
            Some(other) => Err(ConvError::UnsupportedActivation(other.to_string())),
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Silu
    }

    #[inline]
    pub(crate) fn apply(self, y: f64) -> f64 {
        match self {
            Self::None => y,
            Self::Silu => silu(y),
        }
    }

    /// Derivative of the activation at the pre-activation value `y`.
    #[inline]
    pub(crate) fn grad(self, y: f64) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Silu => silu_grad(y),
        }
    }
}

impl FromStr for Activation {
    type Err = ConvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "" => Ok(Self::None),
            other => Self::parse(Some(other)),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Silu => f.write_str("silu"),
        }
    }
}

#[inline]
fn sigmoid(y: f64) -> f64 {
    1.0 / (1.0 + (-y).exp())
}

#[inline]
pub(crate) fn silu(y: f64) -> f64 {
    y * sigmoid(y)
}

/// `d/dy silu(y) = s + y * s * (1 - s)` with `s = sigmoid(y)`.
#[inline]
pub(crate) fn silu_grad(y: f64) -> f64 {
    let s = sigmoid(y);
    s + y * s * (1.0 - s)
}

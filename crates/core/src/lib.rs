//! Depthwise causal 1-D convolution for state-space sequence models.
//!
//! See [`conv`] for the engine and [`testing`] for fixtures shared by the
//! tests, benches and the `causal-conv` harness.

pub mod conv;
pub mod testing;

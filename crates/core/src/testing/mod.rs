//! Shared test utilities for causal-conv-core.
//!
//! Seeded random inputs, tolerance helpers and finite-difference gradients
//! used by the unit tests, the integration tests, the benches and the
//! `causal-conv` validation harness.

mod gradcheck;
mod tensors;

pub use gradcheck::numerical_grad;
pub use tensors::{default_tolerance, max_abs_diff, random_seq_idx, random_tensor};

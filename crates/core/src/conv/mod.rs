//! Depthwise causal 1-D convolution.
//!
//! Each channel of a `(batch, dim, seqlen)` signal is convolved with its own
//! short filter (`width` in `2..=4`) so that output `t` depends only on
//! inputs `<= t`:
//!
//! ```text
//! out[b, d, t] = act(sum_k weight[d, k] * src[b, d, t - (width - 1) + k] + bias[d])
//! ```
//!
//! where `src` is the optional initial state followed by the signal. Entry
//! points:
//!
//! - [`causal_conv1d_fn`] / [`causal_conv1d_fwd`]: full-sequence forward;
//! - [`causal_conv1d_bwd`] and [`CausalConv1dFn`]: gradients;
//! - [`causal_conv1d_update`] and [`ConvState`]: one-step streaming decode;
//! - [`causal_conv1d_ref`] / [`causal_conv1d_update_ref`]: reference engine.
//!
//! The kernels accumulate in `f64` and run on the CPU with rayon; tensors on
//! other devices are copied over and the results copied back.

mod activation;
mod args;
mod backward;
mod error;
mod forward;
mod function;
pub mod layout;
mod reference;
mod state;
mod update;
mod window;

pub use activation::Activation;
pub use args::CausalConv1dArgs;
pub use backward::{causal_conv1d_bwd, Gradients};
pub use error::{ConvError, ErrorKind, Result};
pub use forward::{causal_conv1d_fn, causal_conv1d_fwd, Checkpoint};
pub use function::CausalConv1dFn;
pub use reference::{causal_conv1d_ref, causal_conv1d_update_ref};
pub use state::{tail_state, ConvState};
pub use update::causal_conv1d_update;

use candle_core::Tensor;

use super::args::CausalConv1dArgs;
use super::backward::{causal_conv1d_bwd, Gradients};
use super::error::{ConvError, Result};
use super::forward::{causal_conv1d_fwd, Checkpoint};

/// Forward/backward pair with saved-tensor bookkeeping.
///
/// `forward` records a [`Checkpoint`]; `backward` consumes it. Calling
/// `backward` with no recorded checkpoint, or a second time without
/// [`retain_checkpoint`](Self::retain_checkpoint), fails with
/// [`ConvError::MissingCheckpoint`].
#[derive(Debug, Default)]
pub struct CausalConv1dFn {
    args: CausalConv1dArgs,
    retain: bool,
    saved: Option<Checkpoint>,
}

impl CausalConv1dFn {
    pub fn new(args: CausalConv1dArgs) -> Self {
        Self {
            args,
            retain: false,
            saved: None,
        }
    }

    /// Keep the checkpoint after `backward`, so it can run more than once.
    pub fn retain_checkpoint(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn args(&self) -> &CausalConv1dArgs {
        &self.args
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.saved.as_ref()
    }

    pub fn forward(&mut self, x: &Tensor, weight: &Tensor) -> Result<Tensor> {
        let (out, checkpoint) = causal_conv1d_fwd(x, weight, &self.args)?;
        self.saved = Some(checkpoint);
        Ok(out)
    }

    pub fn backward(&mut self, dout: &Tensor) -> Result<Gradients> {
        let checkpoint = self.saved.as_ref().ok_or(ConvError::MissingCheckpoint)?;
        let grads = causal_conv1d_bwd(checkpoint, dout, None)?;
        if !self.retain {
            self.saved = None;
        }
        Ok(grads)
    }
}

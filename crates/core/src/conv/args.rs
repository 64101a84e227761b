use candle_core::Tensor;

use super::activation::Activation;

/// Optional inputs of a full-sequence convolution.
///
/// Every field is absent by default: no bias add, zero history before the
/// sequence start, no segment masking, identity activation and an
/// engine-allocated output.
#[derive(Debug, Clone, Default)]
pub struct CausalConv1dArgs {
    /// `(dim,)`, added after the convolution and before the activation.
    pub bias: Option<Tensor>,
    /// `(batch, dim, state_len)`: samples immediately preceding the sequence.
    pub initial_state: Option<Tensor>,
    /// `(batch, seqlen)` segment ids of any integer dtype.
    ///
    /// The initial state and the left padding count as part of the segment
    /// of `seq_idx[b, 0]`, so the state still feeds the first segment of
    /// each row. To start every segment from zero history, omit
    /// `initial_state`.
    pub seq_idx: Option<Tensor>,
    pub activation: Activation,
    /// Pre-allocated contiguous `(batch, dim, seqlen)` output buffer.
    pub out: Option<Tensor>,
}

impl CausalConv1dArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bias(mut self, bias: Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_initial_state(mut self, state: Tensor) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_seq_idx(mut self, seq_idx: Tensor) -> Self {
        self.seq_idx = Some(seq_idx);
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_out(mut self, out: Tensor) -> Self {
        self.out = Some(out);
        self
    }
}

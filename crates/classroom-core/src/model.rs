use candle_core::{Device, Tensor, Var};

use crate::error::CoreResult;

/// A trainable next-token model over byte sequences.
///
/// The harness drives models only through this trait: it never looks at the
/// layer composition, only at losses, distributions and the named `Var`s an
/// optimiser has to update.
pub trait Model: Sized {
    /// Per-example training losses for a `[batch, example_length]` batch of
    /// token ids.  Returns a differentiable tensor of shape `[batch]`.
    fn losses(&self, batch: &Tensor) -> CoreResult<Tensor>;

    /// Next-token distribution for `context` (`[n]` or `[1, n]` token ids),
    /// shape `[n_vocab_out]`.  Evaluation mode: no dropout.
    fn inference(&self, context: &Tensor) -> CoreResult<Tensor>;

    /// Longest context the model accepts.
    fn n_ctx(&self) -> usize;

    /// Size of the output vocabulary.
    fn n_vocab_out(&self) -> usize;

    fn device(&self) -> &Device;

    /// Every trainable parameter, sorted by name.
    fn named_parameters(&self) -> CoreResult<Vec<(String, Var)>>;

    /// Independent copy with its weights on `device`.
    fn to_device(&self, device: &Device) -> CoreResult<Self>;

    /// Independent copy: same values, fresh storage, same device.
    fn try_clone(&self) -> CoreResult<Self> {
        self.to_device(self.device())
    }
}

use tch::Tensor;

/// Reversible transform applied to a `[batch, seqlen, dim]` token sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqTransform {
    /// Reverse the token axis.
    Flip,
}

impl SeqTransform {
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            SeqTransform::Flip => xs.flip([1]),
        }
    }

    pub fn invert(self, xs: &Tensor) -> Tensor {
        match self {
            SeqTransform::Flip => xs.flip([1]),
        }
    }
}

/// Ordered record of the transforms applied to a sequence, so any later
/// stage can map tensors back to the original token order and forth again.
#[derive(Debug, Default, Clone)]
pub struct TransformRecord {
    applied: Vec<SeqTransform>,
}

impl TransformRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, xs: &Tensor, transform: SeqTransform) -> Tensor {
        self.applied.push(transform);
        transform.apply(xs)
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Map a transformed tensor back to the original order.
    pub fn undo(&self, xs: &Tensor) -> Tensor {
        self.applied
            .iter()
            .rev()
            .fold(xs.shallow_clone(), |acc, t| t.invert(&acc))
    }

    /// Map an original-order tensor into the transformed order.
    pub fn redo(&self, xs: &Tensor) -> Tensor {
        self.applied
            .iter()
            .fold(xs.shallow_clone(), |acc, t| t.apply(&acc))
    }

    /// Run `f` on `xs` seen in the original order, returning the result in
    /// the transformed order.
    pub fn in_original_order<F>(&self, xs: &Tensor, f: F) -> Tensor
    where
        F: FnOnce(&Tensor) -> Tensor,
    {
        if self.is_empty() {
            return f(xs);
        }
        self.redo(&f(&self.undo(xs)))
    }
}

use tch::Tensor;
use tracing::debug;

use super::head::{extract_features, ClsPositions};
use super::{BiMamba, ClsTokens};
use crate::config::{PoolType, RopeMode};
use crate::torch::ssm::InferenceCache;
use crate::torch::transform::{SeqTransform, TransformRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Skip the classification head.
    pub return_features: bool,
    /// Insert a single head/tail class token at a random position.
    pub random_cls_position: bool,
    pub train: bool,
}

impl BiMamba {
    /// Class-token insertion, position embedding, flip augmentation, the
    /// block stack and the final add-norm.
    ///
    /// Returns the final hidden states `[batch, tokens, embed_dim]` in the
    /// original token order, and where the class tokens sit.
    pub fn forward_hidden(
        &self,
        xs: &Tensor,
        opts: ForwardOptions,
        mut cache: Option<&mut InferenceCache>,
    ) -> (Tensor, Option<ClsPositions>) {
        let (mut x, positions) = self.insert_cls_tokens(xs, opts.random_cls_position);
        let seqlen = x.size()[1];

        if let Some(pos_embed) = &self.pos_embed {
            x = (x + pos_embed).dropout(self.cfg.drop_rate, opts.train);
        }

        let mut record = TransformRecord::new();
        if self.sample_flip() {
            x = record.push(&x, SeqTransform::Flip);
            debug!("flipped token sequence");
        }

        let (hidden, residual) = if self.cfg.bidirectional {
            self.run_pairs(x, &record, cache.as_deref_mut(), opts.train)
        } else {
            self.run_sequential(x, &record, cache.as_deref_mut(), opts.train)
        };
        if let Some(cache) = cache {
            cache.seqlen_offset += seqlen;
        }

        let hidden = match &residual {
            Some(_) => self.final_drop_path.forward(&hidden, opts.train),
            None => hidden,
        };
        let (hidden, _) = self.final_add_norm.forward(&hidden, residual.as_ref());
        (record.undo(&hidden), positions)
    }

    /// Pooled features `[batch, embed_dim]`, or the full token sequence for
    /// `max` / `all` pooling without class tokens.
    pub fn forward_features(
        &self,
        xs: &Tensor,
        opts: ForwardOptions,
        cache: Option<&mut InferenceCache>,
    ) -> Tensor {
        let (hidden, positions) = self.forward_hidden(xs, opts, cache);
        extract_features(&hidden, positions, self.cfg.pool)
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        opts: ForwardOptions,
        cache: Option<&mut InferenceCache>,
    ) -> Tensor {
        let features = self.forward_features(xs, opts, cache);
        if opts.return_features {
            return features;
        }
        let logits = match &self.head {
            Some(head) => features.apply(head),
            None => features,
        };
        // Class-token features are already one vector per sample.
        if self.cfg.pool == PoolType::Max && matches!(self.cls, ClsTokens::None) {
            logits.amax([1], false)
        } else {
            logits
        }
    }

    fn run_sequential(
        &self,
        x: Tensor,
        record: &TransformRecord,
        mut cache: Option<&mut InferenceCache>,
        train: bool,
    ) -> (Tensor, Option<Tensor>) {
        let mut hidden = x;
        let mut residual: Option<Tensor> = None;
        for layer in &self.layers {
            (hidden, residual) = self.apply_rope(&hidden, residual, record);
            let (h, r) = layer.forward(&hidden, residual.as_ref(), cache.as_deref_mut(), train);
            hidden = h;
            residual = Some(r);
        }
        (hidden, residual)
    }

    /// Block `2i` scans the sequence as-is, block `2i + 1` scans it reversed;
    /// outputs and residuals are summed back in the same order.
    fn run_pairs(
        &self,
        x: Tensor,
        record: &TransformRecord,
        mut cache: Option<&mut InferenceCache>,
        train: bool,
    ) -> (Tensor, Option<Tensor>) {
        let reverse = SeqTransform::Flip;
        let mut hidden = x;
        let mut residual: Option<Tensor> = None;
        for pair in self.layers.chunks_exact(2) {
            (hidden, residual) = self.apply_rope(&hidden, residual, record);

            let (h_f, r_f) = pair[0].forward(&hidden, residual.as_ref(), cache.as_deref_mut(), train);
            let residual_b = residual.as_ref().map(|r| reverse.apply(r));
            let (h_b, r_b) = pair[1].forward(
                &reverse.apply(&hidden),
                residual_b.as_ref(),
                cache.as_deref_mut(),
                train,
            );

            hidden = h_f + reverse.invert(&h_b);
            residual = Some(r_f + reverse.invert(&r_b));
        }
        (hidden, residual)
    }

    /// Rotary transform in the original token order.
    fn apply_rope(
        &self,
        hidden: &Tensor,
        residual: Option<Tensor>,
        record: &TransformRecord,
    ) -> (Tensor, Option<Tensor>) {
        let Some(rope) = &self.rope else {
            return (hidden.shallow_clone(), residual);
        };
        let hidden = record.in_original_order(hidden, |h| rope.apply(h));
        let residual = match residual {
            Some(r) if self.cfg.rope == RopeMode::HiddenAndResidual => {
                Some(record.in_original_order(&r, |t| rope.apply(t)))
            }
            other => other,
        };
        (hidden, residual)
    }
}

use tch::{nn, Tensor};

use crate::config::BiMambaConfig;
use crate::torch::drop_path::DropPath;
use crate::torch::mixer::{MixerBuilder, SequenceMixer};
use crate::torch::norm::{add_norm, AddNorm};
use crate::torch::ssm::InferenceCache;

/// Residual unit: add-norm, then the sequence mixer.
#[derive(Debug)]
pub struct MixerBlock {
    mixer: Box<dyn SequenceMixer>,
    add_norm: Box<dyn AddNorm>,
    drop_path: DropPath,
    layer_idx: usize,
}

impl MixerBlock {
    pub fn new(
        mixer: Box<dyn SequenceMixer>,
        add_norm: Box<dyn AddNorm>,
        drop_path: DropPath,
        layer_idx: usize,
    ) -> Self {
        Self {
            mixer,
            add_norm,
            drop_path,
            layer_idx,
        }
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    pub fn drop_path(&self) -> DropPath {
        self.drop_path
    }

    /// `hidden` is the previous block's mixer output (or the embedded input
    /// when `residual` is `None`). Returns `(mixer output, residual)`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        cache: Option<&mut InferenceCache>,
        train: bool,
    ) -> (Tensor, Tensor) {
        let hidden = match residual {
            Some(_) => self.drop_path.forward(hidden, train),
            None => hidden.shallow_clone(),
        };
        let (normed, residual) = self.add_norm.forward(&hidden, residual);
        (self.mixer.forward(&normed, cache), residual)
    }
}

/// One configured block for depth index `layer_idx`.
pub fn create_block(
    p: &nn::Path,
    cfg: &BiMambaConfig,
    mixers: &dyn MixerBuilder,
    layer_idx: usize,
    drop_path: f64,
) -> MixerBlock {
    let mixer = mixers.build(&(p / "mixer"), cfg.embed_dim, layer_idx);
    let add_norm = add_norm(
        &(p / "norm"),
        cfg.add_norm,
        cfg.norm,
        cfg.embed_dim,
        cfg.norm_epsilon,
        cfg.residual_in_fp32,
    );
    MixerBlock::new(mixer, add_norm, DropPath::new(drop_path), layer_idx)
}

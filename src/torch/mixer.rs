use tch::{nn, Tensor};

use crate::config::{BiMambaConfig, ScanVariant, SsmConfig};
use crate::torch::ssm::{InferenceCache, MambaMixer};

/// Sequence-mixing operator used inside a block.
///
/// `[batch, seqlen, d_model] -> [batch, seqlen, d_model]`. When a cache is
/// passed the mixer may record its state under its layer index.
pub trait SequenceMixer: std::fmt::Debug + Send {
    fn forward(&self, xs: &Tensor, cache: Option<&mut InferenceCache>) -> Tensor;

    fn layer_idx(&self) -> usize;
}

/// Builds one mixer per block.
pub trait MixerBuilder {
    fn build(&self, p: &nn::Path, d_model: i64, layer_idx: usize) -> Box<dyn SequenceMixer>;
}

impl SequenceMixer for MambaMixer {
    fn forward(&self, xs: &Tensor, cache: Option<&mut InferenceCache>) -> Tensor {
        MambaMixer::forward(self, xs, cache)
    }

    fn layer_idx(&self) -> usize {
        MambaMixer::layer_idx(self)
    }
}

/// Builds [`MambaMixer`]s running the reference selective scan.
#[derive(Debug, Clone)]
pub struct ReferenceMamba {
    pub ssm: SsmConfig,
    pub scan: ScanVariant,
    pub divide_out: bool,
    pub init_layer_scale: Option<f64>,
}

impl ReferenceMamba {
    pub fn from_config(cfg: &BiMambaConfig) -> Self {
        Self {
            ssm: cfg.ssm.clone(),
            scan: cfg.scan,
            divide_out: cfg.divide_out,
            init_layer_scale: cfg.init_layer_scale,
        }
    }
}

impl MixerBuilder for ReferenceMamba {
    fn build(&self, p: &nn::Path, d_model: i64, layer_idx: usize) -> Box<dyn SequenceMixer> {
        Box::new(MambaMixer::new(
            p,
            d_model,
            layer_idx,
            &self.ssm,
            self.scan,
            self.divide_out,
            self.init_layer_scale,
        ))
    }
}

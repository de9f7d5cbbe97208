use tch::{nn, Tensor};
use tracing::info;

use crate::config::FusionConfig;
use crate::error::ModelResult;
use crate::torch::conv::DepthwiseSeparableConv1d;
use crate::torch::model::{BiMamba, ForwardOptions};
use crate::torch::ssm::InferenceCache;

/// CSI window classifier: `[batch, in_channels, time]` through the
/// depthwise-separable conv, then the bidirectional Mamba over time.
#[derive(Debug)]
pub struct FusionModel {
    conv: DepthwiseSeparableConv1d,
    backbone: BiMamba,
    cfg: FusionConfig,
}

impl FusionModel {
    pub fn new(p: &nn::Path, cfg: &FusionConfig) -> ModelResult<Self> {
        cfg.validate()?;
        let conv = DepthwiseSeparableConv1d::new(
            &(p / "dw"),
            cfg.in_channels,
            cfg.out_channels,
            cfg.kernel_size,
        );
        let backbone = BiMamba::new(&(p / "bimodel"), &cfg.backbone_config())?;

        info!(
            in_channels = cfg.in_channels,
            kernel_size = cfg.kernel_size,
            time_steps = cfg.time_steps,
            tokens = cfg.conv_output_len(),
            "built fusion model"
        );

        Ok(Self {
            conv,
            backbone,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.cfg
    }

    pub fn backbone(&self) -> &BiMamba {
        &self.backbone
    }

    /// Conv output in sequence-major layout, `[batch, tokens, out_channels]`.
    pub fn embed(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv).transpose(1, 2)
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        opts: ForwardOptions,
        cache: Option<&mut InferenceCache>,
    ) -> Tensor {
        self.backbone.forward(&self.embed(xs), opts, cache)
    }
}

impl nn::ModuleT for FusionModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.forward(
            xs,
            ForwardOptions {
                train,
                ..Default::default()
            },
            None,
        )
    }
}

mod block;
mod forward;
mod head;

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::nn::{self, Init};
use tch::Tensor;
use tracing::info;

use crate::config::{BiMambaConfig, ClsTokenPolicy, RopeMode};
use crate::constants::{FLIP_MARGIN, INIT_STD};
use crate::error::ModelResult;
use crate::torch::drop_path::{drop_path_schedule, DropPath};
use crate::torch::init::trunc_normal_var;
use crate::torch::mixer::{MixerBuilder, ReferenceMamba};
use crate::torch::norm::{add_norm, AddNorm};
use crate::torch::rope::Rope;

pub use block::{create_block, MixerBlock};
pub use forward::ForwardOptions;
pub use head::{pool_tokens, ClsPositions};

#[derive(Debug)]
enum ClsTokens {
    None,
    Single(Tensor),
    Double { head: Tensor, tail: Tensor },
}

/// Bidirectional Mamba over `[batch, tokens, embed_dim]` sequences.
#[derive(Debug)]
pub struct BiMamba {
    cfg: BiMambaConfig,
    cls: ClsTokens,
    pos_embed: Option<Tensor>,
    layers: Vec<MixerBlock>,
    final_add_norm: Box<dyn AddNorm>,
    final_drop_path: DropPath,
    head: Option<nn::Linear>,
    rope: Option<Rope>,
    rng: RefCell<StdRng>,
}

impl BiMamba {
    /// Builds the model with reference selective-scan mixers.
    pub fn new(p: &nn::Path, cfg: &BiMambaConfig) -> ModelResult<Self> {
        Self::with_mixer(p, cfg, &ReferenceMamba::from_config(cfg))
    }

    /// Builds the model with mixers from `mixers`, one per block.
    pub fn with_mixer(p: &nn::Path, cfg: &BiMambaConfig, mixers: &dyn MixerBuilder) -> ModelResult<Self> {
        cfg.validate()?;
        let d = cfg.embed_dim;

        let cls = match cfg.cls_token {
            ClsTokenPolicy::None => ClsTokens::None,
            ClsTokenPolicy::Double => ClsTokens::Double {
                head: trunc_normal_var(p, "cls_token_head", &[1, 1, d], INIT_STD),
                tail: trunc_normal_var(p, "cls_token_tail", &[1, 1, d], INIT_STD),
            },
            _ => ClsTokens::Single(trunc_normal_var(p, "cls_token", &[1, 1, d], INIT_STD)),
        };

        let pos_embed = cfg
            .abs_pos_embed
            .then(|| trunc_normal_var(p, "pos_embed", &[1, cfg.total_tokens(), d], INIT_STD));

        let dpr = drop_path_schedule(cfg.drop_path_rate, cfg.depth);
        let layers = dpr
            .iter()
            .enumerate()
            .map(|(i, &rate)| create_block(&(p / "layers" / i), cfg, mixers, i, rate))
            .collect();

        let final_add_norm = add_norm(
            &(p / "norm_f"),
            cfg.add_norm,
            cfg.norm,
            d,
            cfg.norm_epsilon,
            cfg.residual_in_fp32,
        );

        let head = (cfg.num_classes > 0).then(|| {
            let hp = p / "head";
            let ws = trunc_normal_var(&hp, "weight", &[cfg.num_classes, d], INIT_STD);
            let bs = hp.var("bias", &[cfg.num_classes], Init::Const(0.0));
            nn::Linear { ws, bs: Some(bs) }
        });

        let rope = (cfg.rope != RopeMode::Off).then(|| Rope::new(d, p.device()));

        info!(
            depth = cfg.depth,
            embed_dim = d,
            bidirectional = cfg.bidirectional,
            scan = ?cfg.scan,
            cls_token = ?cfg.cls_token,
            add_norm = ?cfg.add_norm,
            "built bidirectional mamba"
        );

        Ok(Self {
            cfg: cfg.clone(),
            cls,
            pos_embed,
            layers,
            final_add_norm,
            final_drop_path: DropPath::new(cfg.drop_path_rate),
            head,
            rope,
            rng: RefCell::new(StdRng::seed_from_u64(cfg.seed)),
        })
    }

    pub fn config(&self) -> &BiMambaConfig {
        &self.cfg
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn embed_dim(&self) -> i64 {
        self.cfg.embed_dim
    }

    pub fn layers(&self) -> &[MixerBlock] {
        &self.layers
    }

    /// Restart the flip / class-token placement draws from `seed`.
    pub fn reseed(&self, seed: u64) {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn sample_flip(&self) -> bool {
        let ratio = self.cfg.flip_sequence_ratio;
        ratio > 0.0 && ratio - self.rng.borrow_mut().gen::<f64>() > FLIP_MARGIN
    }
}

impl nn::ModuleT for BiMamba {
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

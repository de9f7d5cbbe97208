use tch::nn::{self, Init};
use tch::{Kind, Tensor};

use crate::config::{AddNormMode, NormKind};

/// LayerNorm or RMSNorm over the last dim.
#[derive(Debug)]
pub struct Norm {
    kind: NormKind,
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
    dim: i64,
}

impl Norm {
    pub fn new(p: &nn::Path, kind: NormKind, dim: i64, eps: f64) -> Self {
        let weight = p.var("weight", &[dim], Init::Const(1.0));
        let bias = match kind {
            NormKind::LayerNorm => Some(p.var("bias", &[dim], Init::Const(0.0))),
            NormKind::RmsNorm => None,
        };
        Self {
            kind,
            weight,
            bias,
            eps,
            dim,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        match self.kind {
            NormKind::LayerNorm => x.layer_norm(
                [self.dim],
                Some(&self.weight),
                self.bias.as_ref(),
                self.eps,
                true,
            ),
            NormKind::RmsNorm => {
                let x_f32 = x.to_kind(Kind::Float);
                let rms =
                    (x_f32.pow_tensor_scalar(2).mean_dim(-1, true, Kind::Float) + self.eps).sqrt();
                (x_f32 / rms * &self.weight).to_kind(x.kind())
            }
        }
    }

    /// Precision the norm weights are stored in.
    pub fn kind(&self) -> Kind {
        self.weight.kind()
    }

    /// `x (+ residual)` then normalize, all in f32. Returns `(normed, sum)`;
    /// `sum` stays f32 when `residual_in_fp32`, otherwise takes `x`'s kind.
    pub fn fused_add(
        &self,
        x: &Tensor,
        residual: Option<&Tensor>,
        residual_in_fp32: bool,
    ) -> (Tensor, Tensor) {
        let x_f32 = x.to_kind(Kind::Float);
        let sum = match residual {
            Some(r) => x_f32 + r.to_kind(Kind::Float),
            None => x_f32,
        };
        let weight = self.weight.to_kind(Kind::Float);
        let normed = match self.kind {
            NormKind::LayerNorm => {
                let bias = self.bias.as_ref().map(|b| b.to_kind(Kind::Float));
                sum.layer_norm([self.dim], Some(&weight), bias.as_ref(), self.eps, true)
            }
            NormKind::RmsNorm => {
                let rms = (sum.pow_tensor_scalar(2).mean_dim(-1, true, Kind::Float) + self.eps)
                    .rsqrt();
                &sum * rms * &weight
            }
        };
        let sum = if residual_in_fp32 {
            sum
        } else {
            sum.to_kind(x.kind())
        };
        (normed.to_kind(x.kind()), sum)
    }
}

/// Residual accumulation followed by normalization.
///
/// `forward(hidden, None)` seeds the residual with `hidden`; otherwise `hidden`
/// is added onto `residual`. Returns `(normalized hidden, new residual)`.
pub trait AddNorm: std::fmt::Debug + Send {
    fn forward(&self, hidden: &Tensor, residual: Option<&Tensor>) -> (Tensor, Tensor);
}

#[derive(Debug)]
pub struct UnfusedAddNorm {
    norm: Norm,
    residual_in_fp32: bool,
}

impl AddNorm for UnfusedAddNorm {
    fn forward(&self, hidden: &Tensor, residual: Option<&Tensor>) -> (Tensor, Tensor) {
        let residual = match residual {
            Some(r) => r + hidden,
            None => hidden.shallow_clone(),
        };
        let normed = self.norm.forward(&residual.to_kind(self.norm.kind()));
        let residual = if self.residual_in_fp32 {
            residual.to_kind(Kind::Float)
        } else {
            residual
        };
        (normed, residual)
    }
}

#[derive(Debug)]
pub struct FusedAddNorm {
    norm: Norm,
    residual_in_fp32: bool,
}

impl AddNorm for FusedAddNorm {
    fn forward(&self, hidden: &Tensor, residual: Option<&Tensor>) -> (Tensor, Tensor) {
        self.norm.fused_add(hidden, residual, self.residual_in_fp32)
    }
}

pub fn add_norm(
    p: &nn::Path,
    mode: AddNormMode,
    kind: NormKind,
    dim: i64,
    eps: f64,
    residual_in_fp32: bool,
) -> Box<dyn AddNorm> {
    let norm = Norm::new(p, kind, dim, eps);
    match mode {
        AddNormMode::Unfused => Box::new(UnfusedAddNorm {
            norm,
            residual_in_fp32,
        }),
        AddNormMode::Fused => Box::new(FusedAddNorm {
            norm,
            residual_in_fp32,
        }),
    }
}

use tch::{Kind, Tensor};

/// Stochastic depth: zeroes a whole sample's branch with probability `prob`
/// during training and rescales the survivors by `1 / (1 - prob)`.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    prob: f64,
}

impl DropPath {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn prob(&self) -> f64 {
        self.prob
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Tensor {
        if !train || self.prob <= 0.0 {
            return xs.shallow_clone();
        }
        let keep = 1.0 - self.prob;
        let mut shape = vec![1i64; xs.dim()];
        shape[0] = xs.size()[0];
        let mask = Tensor::rand(shape.as_slice(), (Kind::Float, xs.device()))
            .lt(keep)
            .to_kind(xs.kind());
        xs * mask / keep
    }
}

/// Per-block drop-path rates: `[0] ++ linspace(0, rate, depth)`, truncated
/// to `depth`. Block 0 and block 1 never drop.
pub fn drop_path_schedule(rate: f64, depth: usize) -> Vec<f64> {
    let linspace = |i: usize| {
        if depth <= 1 {
            0.0
        } else {
            rate * i as f64 / (depth - 1) as f64
        }
    };
    std::iter::once(0.0)
        .chain((0..depth).map(linspace))
        .take(depth)
        .collect()
}

use tch::{Device, Kind, Tensor};

use crate::constants::ROPE_THETA;

/// Rotary position transform over the token axis. Rotates consecutive
/// `(even, odd)` channel pairs by `pos * theta^(-2i/dim)`.
#[derive(Debug)]
pub struct Rope {
    inv_freq: Tensor,
    dim: i64,
}

impl Rope {
    pub fn new(dim: i64, device: Device) -> Self {
        let half = dim / 2;
        let inv_freq = (Tensor::arange(half, (Kind::Float, device)) * (-2.0 * ROPE_THETA.ln() / dim as f64))
            .exp();
        Self { inv_freq, dim }
    }

    /// `[batch, seqlen, dim] -> [batch, seqlen, dim]`
    pub fn apply(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (batch, seqlen) = (size[0], size[1]);
        let half = self.dim / 2;

        let pos = Tensor::arange(seqlen, (Kind::Float, xs.device()));
        let freqs = pos.unsqueeze(1) * self.inv_freq.to_device(xs.device()).unsqueeze(0);
        let (cos, sin) = (freqs.cos(), freqs.sin());

        let pairs = xs.to_kind(Kind::Float).reshape([batch, seqlen, half, 2]);
        let x1 = pairs.select(-1, 0);
        let x2 = pairs.select(-1, 1);
        let r1 = &x1 * &cos - &x2 * &sin;
        let r2 = &x1 * &sin + &x2 * &cos;
        Tensor::stack(&[r1, r2], -1)
            .reshape([batch, seqlen, self.dim])
            .to_kind(xs.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let rope = Rope::new(8, Device::Cpu);
        let x = Tensor::randn([2, 5, 8], (Kind::Float, Device::Cpu));
        let y = rope.apply(&x);
        assert_eq!(y.size(), vec![2, 5, 8]);
        let diff = (y.select(1, 0) - x.select(1, 0)).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn preserves_pair_norms() {
        let rope = Rope::new(16, Device::Cpu);
        let x = Tensor::randn([1, 9, 16], (Kind::Float, Device::Cpu));
        let y = rope.apply(&x);
        let norm = |t: &Tensor| {
            t.reshape([1, 9, 8, 2])
                .pow_tensor_scalar(2)
                .sum_dim_intlist(-1, false, Kind::Float)
        };
        let diff = (norm(&x) - norm(&y)).abs().max().double_value(&[]);
        assert!(diff < 1e-4);
    }

    #[test]
    fn first_pair_rotates_by_position() {
        let rope = Rope::new(4, Device::Cpu);
        // (1, 0) in the first pair, frequency 1
        let x = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 0.0])
            .view([1, 1, 4])
            .repeat([1, 3, 1]);
        let y = rope.apply(&x);
        for t in 0..3 {
            let angle = t as f64;
            assert!((y.double_value(&[0, t, 0]) - angle.cos()).abs() < 1e-5);
            assert!((y.double_value(&[0, t, 1]) - angle.sin()).abs() < 1e-5);
        }
    }
}

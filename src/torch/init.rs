use std::f64::consts::SQRT_2;

use tch::{nn, Kind, Tensor};

/// Normal(0, std) truncated to [-2, 2], sampled by inverse CDF.
pub(crate) fn trunc_normal(shape: &[i64], std: f64, device: tch::Device) -> Tensor {
    let (lo, hi) = (-2.0, 2.0);
    let norm_cdf = |x: f64| (1.0 + Tensor::from(x / SQRT_2).erf().double_value(&[])) / 2.0;
    let l = norm_cdf(lo / std);
    let u = norm_cdf(hi / std);
    let mut t = Tensor::empty(shape, (Kind::Float, device)).uniform_(2.0 * l - 1.0, 2.0 * u - 1.0);
    let _ = t.erfinv_();
    (t * (std * SQRT_2)).clamp(lo, hi)
}

pub(crate) fn trunc_normal_var(p: &nn::Path, name: &str, shape: &[i64], std: f64) -> Tensor {
    let init = trunc_normal(shape, std, p.device());
    p.var_copy(name, &init)
}

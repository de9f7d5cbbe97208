use std::f64::consts::PI;

use tch::Tensor;

/// Deterministic CSI-like amplitudes, `[batch, channels, time]`.
///
/// Each channel is a slow sinusoid around 0.5 with a per-channel phase;
/// sample `b` is shifted by `offset + b` windows.
pub fn synthetic_csi(batch: i64, channels: i64, time: i64, offset: usize) -> Tensor {
    let mut values = Vec::with_capacity((batch * channels * time) as usize);
    for b in 0..batch {
        let idx = (offset as i64 + b) as f64;
        for k in 0..channels {
            for t in 0..time {
                let phase = idx * 0.01 + t as f64 * 0.1 + k as f64 * 0.05;
                values.push((0.5 + 0.3 * (2.0 * PI * phase).sin()) as f32);
            }
        }
    }
    Tensor::from_slice(&values).view([batch, channels, time])
}

use tch::{nn, Tensor};

/// Per-channel temporal conv (each input channel expanded to `kernel_size`
/// maps) followed by a 1x1 conv mixing channels down to `out_channels`.
///
/// `[batch, in_channels, time] -> [batch, out_channels, time']`, with
/// `time' == time` for odd kernel sizes.
#[derive(Debug)]
pub struct DepthwiseSeparableConv1d {
    depthwise: nn::Conv1D,
    pointwise: nn::Conv1D,
}

impl DepthwiseSeparableConv1d {
    pub fn new(p: &nn::Path, in_channels: i64, out_channels: i64, kernel_size: i64) -> Self {
        let depthwise = nn::conv1d(
            p / "depthwise",
            in_channels,
            in_channels * kernel_size,
            kernel_size,
            nn::ConvConfig {
                groups: in_channels,
                padding: kernel_size / 2,
                ..Default::default()
            },
        );
        let pointwise = nn::conv1d(
            p / "pointwise",
            in_channels * kernel_size,
            out_channels,
            1,
            Default::default(),
        );
        Self {
            depthwise,
            pointwise,
        }
    }
}

impl nn::Module for DepthwiseSeparableConv1d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.depthwise).apply(&self.pointwise)
    }
}

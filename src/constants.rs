pub const DEPTH: usize = 2;
pub const EMBED_DIM: i64 = 192;
/// Token count the position embedding is sized for when no front end derives it.
pub const NUM_TOKENS: i64 = 3;
pub const NUM_CLASSES: i64 = 1000;
pub const DROP_RATE: f64 = 0.1;
pub const DROP_PATH_RATE: f64 = 0.1;
pub const NORM_EPS: f64 = 1e-5;
pub const SEED: u64 = 42;

/// Flip draws must clear the ratio by this margin.
pub const FLIP_MARGIN: f64 = 1e-5;

pub const INIT_STD: f64 = 0.02;
pub const ROPE_THETA: f64 = 10_000.0;

pub mod csi {
    /// 3 antenna pairs x 30 subcarriers
    pub const IN_CHANNELS: i64 = 90;
    pub const KERNEL_SIZE: i64 = 3;
    pub const TIME_STEPS: i64 = 100;
    pub const NUM_ACTIVITIES: i64 = 6;
}

//! Model configuration.
//!
//! Every architecture switch is a tagged variant rather than a loose flag, and
//! each config is validated once by [`BiMambaConfig::validate`] /
//! [`FusionConfig::validate`] before any tensor is allocated.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{self, csi};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

/// How residual addition and normalization are combined inside each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AddNormMode {
    Unfused,
    /// One routine adds and normalizes in f32.
    Fused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RopeMode {
    Off,
    Hidden,
    HiddenAndResidual,
}

/// Scan performed inside each mixer. `V1` and `V2` scan both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScanVariant {
    None,
    /// Shared projections, separate backward `A`.
    V1,
    /// Separate conv, projections, `A` and `D` for the backward scan.
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ClsTokenPolicy {
    None,
    Head,
    Tail,
    Middle,
    /// One token at the head and one at the tail, averaged on the way out.
    Double,
}

impl ClsTokenPolicy {
    pub fn num_tokens(self) -> i64 {
        match self {
            ClsTokenPolicy::None => 0,
            ClsTokenPolicy::Double => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PoolType {
    /// Last token.
    None,
    Mean,
    /// Max over tokens, taken after the head.
    Max,
    All,
}

impl FromStr for PoolType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PoolType::None),
            "mean" => Ok(PoolType::Mean),
            "max" => Ok(PoolType::Max),
            "all" => Ok(PoolType::All),
            other => Err(ConfigError::UnknownPoolType(other.to_string())),
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolType::None => "none",
            PoolType::Mean => "mean",
            PoolType::Max => "max",
            PoolType::All => "all",
        };
        f.write_str(name)
    }
}

impl TryFrom<String> for PoolType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PoolType> for String {
    fn from(pool: PoolType) -> Self {
        pool.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtInit {
    Random,
    Constant,
}

/// Selective-scan mixer hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsmConfig {
    pub d_state: i64,
    pub d_conv: i64,
    pub expand: i64,
    /// `None` derives `ceil(d_model / 16)`.
    pub dt_rank: Option<i64>,
    pub dt_min: f64,
    pub dt_max: f64,
    pub dt_init: DtInit,
    pub dt_scale: f64,
    pub dt_init_floor: f64,
    pub conv_bias: bool,
    pub bias: bool,
}

impl Default for SsmConfig {
    fn default() -> Self {
        Self {
            d_state: 16,
            d_conv: 4,
            expand: 2,
            dt_rank: None,
            dt_min: 0.001,
            dt_max: 0.1,
            dt_init: DtInit::Random,
            dt_scale: 1.0,
            dt_init_floor: 1e-4,
            conv_bias: true,
            bias: false,
        }
    }
}

impl SsmConfig {
    pub fn d_inner(&self, d_model: i64) -> i64 {
        self.expand * d_model
    }

    pub fn dt_rank(&self, d_model: i64) -> i64 {
        self.dt_rank.unwrap_or((d_model + 15) / 16)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.d_state <= 0 {
            return Err(ConfigError::invalid_value("ssm.d_state", "must be > 0"));
        }
        if self.d_conv <= 0 {
            return Err(ConfigError::invalid_value("ssm.d_conv", "must be > 0"));
        }
        if self.expand <= 0 {
            return Err(ConfigError::invalid_value("ssm.expand", "must be > 0"));
        }
        if let Some(rank) = self.dt_rank {
            if rank <= 0 {
                return Err(ConfigError::invalid_value("ssm.dt_rank", "must be > 0"));
            }
        }
        if self.dt_min <= 0.0 || self.dt_min > self.dt_max {
            return Err(ConfigError::invalid_value(
                "ssm.dt_min",
                format!("need 0 < dt_min <= dt_max, got {} / {}", self.dt_min, self.dt_max),
            ));
        }
        if self.dt_init_floor <= 0.0 {
            return Err(ConfigError::invalid_value("ssm.dt_init_floor", "must be > 0"));
        }
        if self.dt_scale <= 0.0 {
            return Err(ConfigError::invalid_value("ssm.dt_scale", "must be > 0"));
        }
        Ok(())
    }
}

/// Bidirectional Mamba sequence model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiMambaConfig {
    pub depth: usize,
    pub embed_dim: i64,
    /// Sequence length before class tokens are inserted.
    pub num_tokens: i64,
    /// `0` replaces the classification head with the identity.
    pub num_classes: i64,
    pub drop_rate: f64,
    pub drop_path_rate: f64,
    pub norm_epsilon: f64,
    pub norm: NormKind,
    pub add_norm: AddNormMode,
    pub residual_in_fp32: bool,
    pub rope: RopeMode,
    pub bidirectional: bool,
    /// Values <= 0 disable flip augmentation.
    pub flip_sequence_ratio: f64,
    pub scan: ScanVariant,
    pub cls_token: ClsTokenPolicy,
    pub abs_pos_embed: bool,
    pub divide_out: bool,
    pub init_layer_scale: Option<f64>,
    pub pool: PoolType,
    pub ssm: SsmConfig,
    /// Seeds flip and class-token placement draws.
    pub seed: u64,
}

impl Default for BiMambaConfig {
    fn default() -> Self {
        Self {
            depth: constants::DEPTH,
            embed_dim: constants::EMBED_DIM,
            num_tokens: constants::NUM_TOKENS,
            num_classes: constants::NUM_CLASSES,
            drop_rate: constants::DROP_RATE,
            drop_path_rate: constants::DROP_PATH_RATE,
            norm_epsilon: constants::NORM_EPS,
            norm: NormKind::LayerNorm,
            add_norm: AddNormMode::Unfused,
            residual_in_fp32: false,
            rope: RopeMode::Off,
            bidirectional: true,
            flip_sequence_ratio: -1.0,
            scan: ScanVariant::V1,
            cls_token: ClsTokenPolicy::None,
            abs_pos_embed: false,
            divide_out: false,
            init_layer_scale: None,
            pool: PoolType::None,
            ssm: SsmConfig::default(),
            seed: constants::SEED,
        }
    }
}

impl BiMambaConfig {
    /// Length of the token axis once class tokens are in place.
    pub fn total_tokens(&self) -> i64 {
        self.num_tokens + self.cls_token.num_tokens()
    }

    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(self, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth == 0 {
            return Err(ConfigError::invalid_value("depth", "must be > 0"));
        }
        if self.bidirectional && self.depth % 2 != 0 {
            return Err(ConfigError::OddBidirectionalDepth { depth: self.depth });
        }
        if self.embed_dim <= 0 {
            return Err(ConfigError::invalid_value("embed_dim", "must be > 0"));
        }
        if self.num_tokens <= 0 {
            return Err(ConfigError::invalid_value("num_tokens", "must be > 0"));
        }
        if self.num_classes < 0 {
            return Err(ConfigError::invalid_value("num_classes", "must be >= 0"));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(ConfigError::invalid_value(
                "drop_rate",
                format!("must be in [0, 1), got {}", self.drop_rate),
            ));
        }
        if !(0.0..1.0).contains(&self.drop_path_rate) {
            return Err(ConfigError::invalid_value(
                "drop_path_rate",
                format!("must be in [0, 1), got {}", self.drop_path_rate),
            ));
        }
        if self.norm_epsilon <= 0.0 {
            return Err(ConfigError::invalid_value("norm_epsilon", "must be > 0"));
        }
        if self.rope != RopeMode::Off && self.embed_dim % 2 != 0 {
            return Err(ConfigError::invalid_value(
                "rope",
                format!("rotary transform needs an even embed_dim, got {}", self.embed_dim),
            ));
        }
        if !self.flip_sequence_ratio.is_finite() {
            return Err(ConfigError::invalid_value("flip_sequence_ratio", "must be finite"));
        }
        if let Some(scale) = self.init_layer_scale {
            if !scale.is_finite() {
                return Err(ConfigError::invalid_value("init_layer_scale", "must be finite"));
            }
        }
        self.ssm.validate()
    }
}

/// Convolution front end plus sequence model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub in_channels: i64,
    /// Must match `model.embed_dim`.
    pub out_channels: i64,
    pub kernel_size: i64,
    pub time_steps: i64,
    pub model: BiMambaConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            in_channels: csi::IN_CHANNELS,
            out_channels: constants::EMBED_DIM,
            kernel_size: csi::KERNEL_SIZE,
            time_steps: csi::TIME_STEPS,
            model: BiMambaConfig {
                num_tokens: csi::TIME_STEPS,
                num_classes: csi::NUM_ACTIVITIES,
                cls_token: ClsTokenPolicy::Double,
                ..Default::default()
            },
        }
    }
}

impl FusionConfig {
    /// Token count produced by the convolution front end.
    pub fn conv_output_len(&self) -> i64 {
        self.time_steps + 2 * (self.kernel_size / 2) - self.kernel_size + 1
    }

    /// The sequence model config with its token count taken from the front end.
    pub fn backbone_config(&self) -> BiMambaConfig {
        BiMambaConfig {
            num_tokens: self.conv_output_len(),
            ..self.model.clone()
        }
    }

    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(self, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.in_channels <= 0 {
            return Err(ConfigError::invalid_value("in_channels", "must be > 0"));
        }
        if self.kernel_size <= 0 {
            return Err(ConfigError::invalid_value("kernel_size", "must be > 0"));
        }
        if self.time_steps <= 0 {
            return Err(ConfigError::invalid_value("time_steps", "must be > 0"));
        }
        if self.out_channels != self.model.embed_dim {
            return Err(ConfigError::dimension_mismatch(
                "out_channels",
                self.model.embed_dim,
                self.out_channels,
            ));
        }
        self.backbone_config().validate()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
    std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_configs_are_valid() {
        BiMambaConfig::default().validate().unwrap();
        FusionConfig::default().validate().unwrap();
    }

    #[test]
    fn odd_depth_is_rejected_when_bidirectional() {
        let cfg = BiMambaConfig {
            depth: 3,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OddBidirectionalDepth { depth: 3 })
        ));

        let unidirectional = BiMambaConfig {
            depth: 3,
            bidirectional: false,
            ..Default::default()
        };
        unidirectional.validate().unwrap();
    }

    #[test]
    fn zero_depth_is_rejected() {
        let cfg = BiMambaConfig {
            depth: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "depth", .. })
        ));
    }

    #[test]
    fn rope_needs_even_embed_dim() {
        let cfg = BiMambaConfig {
            embed_dim: 33,
            rope: RopeMode::Hidden,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pool_type_parses_known_names_only() {
        assert_eq!("mean".parse::<PoolType>().unwrap(), PoolType::Mean);
        assert_eq!("all".parse::<PoolType>().unwrap(), PoolType::All);
        match "avg".parse::<PoolType>() {
            Err(ConfigError::UnknownPoolType(name)) => assert_eq!(name, "avg"),
            other => panic!("expected UnknownPoolType, got {other:?}"),
        }
    }

    #[test]
    fn unknown_pool_type_in_json_fails_to_parse() {
        let json = r#"{ "pool": "median" }"#;
        let err = serde_json::from_str::<BiMambaConfig>(json).unwrap_err();
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn fusion_out_channels_must_match_embed_dim() {
        let cfg = FusionConfig {
            out_channels: 128,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DimensionMismatch { expected: 192, actual: 128, .. })
        ));
    }

    #[test]
    fn conv_output_len_preserves_time_for_odd_kernels() {
        for k in [1, 3, 5, 7] {
            let cfg = FusionConfig {
                kernel_size: k,
                time_steps: 50,
                ..Default::default()
            };
            assert_eq!(cfg.conv_output_len(), 50);
        }
        let even = FusionConfig {
            kernel_size: 4,
            time_steps: 50,
            ..Default::default()
        };
        assert_eq!(even.conv_output_len(), 51);
    }

    #[test]
    fn json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("fusion.json");
        let cfg = FusionConfig {
            model: BiMambaConfig {
                pool: PoolType::Mean,
                scan: ScanVariant::V2,
                init_layer_scale: Some(1e-3),
                ..FusionConfig::default().model
            },
            ..Default::default()
        };
        cfg.to_json(&path).unwrap();
        let loaded = FusionConfig::from_json(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(
            BiMambaConfig::from_json(&path),
            Err(ConfigError::FileRead { .. })
        ));
    }
}

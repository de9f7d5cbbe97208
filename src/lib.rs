pub mod config;
pub mod constants;
pub mod error;
pub mod synthetic;
pub mod torch;

pub use config::{BiMambaConfig, FusionConfig};
pub use error::{ConfigError, ModelError, ModelResult};
pub use torch::fusion::FusionModel;
pub use torch::model::{BiMamba, ForwardOptions};

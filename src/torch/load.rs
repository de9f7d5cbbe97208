use std::path::Path;

use tch::{nn, Device};
use tracing::{info, warn};

use crate::config::FusionConfig;
use crate::error::ModelResult;
use crate::torch::fusion::FusionModel;

pub fn build_model(cfg: &FusionConfig, device: Device) -> ModelResult<(nn::VarStore, FusionModel)> {
    let vs = nn::VarStore::new(device);
    let model = FusionModel::new(&vs.root(), cfg)?;
    Ok((vs, model))
}

/// Loads what `path` provides; tensors it lacks keep their initial values.
pub fn load_var_store_partial<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> ModelResult<Vec<String>> {
    let missing = vs.load_partial(path.as_ref())?;
    if !missing.is_empty() {
        warn!(
            missing = missing.len(),
            first = %missing[0],
            "loaded weights with missing tensors"
        );
    }
    Ok(missing)
}

pub fn load_model<P: AsRef<Path>>(
    path: P,
    cfg: &FusionConfig,
    device: Device,
) -> ModelResult<(nn::VarStore, FusionModel)> {
    let (mut vs, model) = build_model(cfg, device)?;
    load_var_store_partial(&mut vs, &path)?;
    info!(path = %path.as_ref().display(), ?device, "model loaded");
    Ok((vs, model))
}

pub fn save_weights<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> ModelResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    vs.save(path)?;
    info!(path = %path.display(), tensors = vs.len(), "saved weights");
    Ok(())
}

pub fn num_parameters(vs: &nn::VarStore) -> i64 {
    vs.trainable_variables().iter().map(|t| t.numel() as i64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiMambaConfig;
    use tch::Tensor;

    fn tiny() -> FusionConfig {
        FusionConfig {
            in_channels: 6,
            out_channels: 16,
            kernel_size: 3,
            time_steps: 12,
            model: BiMambaConfig {
                embed_dim: 16,
                num_classes: 4,
                ..Default::default()
            },
        }
    }

    #[test]
    fn saved_weights_reload_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weights.ot");

        let (vs, _model) = build_model(&tiny(), Device::Cpu).unwrap();
        save_weights(&vs, &path).unwrap();

        let (loaded, _model) = load_model(&path, &tiny(), Device::Cpu).unwrap();
        let (a, b) = (vs.variables(), loaded.variables());
        assert_eq!(a.len(), b.len());
        for (name, tensor) in &a {
            assert!(tensor.equal(&b[name]), "{name} differs after reload");
        }
    }

    #[test]
    fn partial_load_reports_missing_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.ot");

        let (vs, _model) = build_model(&tiny(), Device::Cpu).unwrap();
        save_weights(&vs, &path).unwrap();

        // Adds a head class token the saved file does not have.
        let mut cfg = tiny();
        cfg.model.cls_token = crate::config::ClsTokenPolicy::Head;
        let (mut vs2, _model) = build_model(&cfg, Device::Cpu).unwrap();
        let missing = load_var_store_partial(&mut vs2, &path).unwrap();
        assert_eq!(missing, vec!["bimodel.cls_token".to_string()]);
    }

    #[test]
    fn parameter_count_matches_variables() {
        let (vs, _model) = build_model(&tiny(), Device::Cpu).unwrap();
        let expected: i64 = vs
            .variables()
            .values()
            .map(|t: &Tensor| t.size().iter().product::<i64>())
            .sum();
        assert_eq!(num_parameters(&vs), expected);
        assert!(expected > 0);
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tch::{Device, Kind};
use tracing_subscriber::filter::LevelFilter;

use wifi_bimamba::config::{ClsTokenPolicy, PoolType, ScanVariant};
use wifi_bimamba::synthetic::synthetic_csi;
use wifi_bimamba::torch::load::{build_model, load_model, num_parameters, save_weights};
use wifi_bimamba::{FusionConfig, ForwardOptions};

#[derive(Parser)]
#[command(name = "wifi_bimamba")]
#[command(about = "WiFi CSI activity recognition with a bidirectional Mamba", long_about = None)]
struct Cli {
    /// off, error, warn, info, debug or trace
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    InitConfig {
        #[arg(short, long, default_value = "configs/fusion.json")]
        out: PathBuf,

        #[arg(long)]
        depth: Option<usize>,

        #[arg(long)]
        classes: Option<i64>,

        #[arg(long, value_enum)]
        cls_token: Option<ClsTokenPolicy>,

        #[arg(long, value_enum)]
        scan: Option<ScanVariant>,

        /// none, mean, max or all
        #[arg(long)]
        pool: Option<PoolType>,
    },
    /// Validate a config and print the parameter layout
    Summary {
        #[arg(short, long, default_value = "configs/fusion.json")]
        config: PathBuf,
    },
    /// Forward a synthetic CSI window
    Infer {
        #[arg(short, long, default_value = "configs/fusion.json")]
        config: PathBuf,

        #[arg(short, long)]
        weights: Option<PathBuf>,

        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
        batch: i64,

        #[arg(short, long, default_value_t = 0)]
        seed: i64,

        /// Return pooled features instead of logits
        #[arg(long, default_value_t = false)]
        features: bool,

        #[arg(long, default_value_t = false)]
        random_cls: bool,
    },
    /// Save freshly initialised weights
    InitWeights {
        #[arg(short, long, default_value = "configs/fusion.json")]
        config: PathBuf,

        #[arg(short, long, default_value = "weights/init.ot")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    println!("{}", "Start".green());

    match cli.command {
        Commands::InitConfig {
            out,
            depth,
            classes,
            cls_token,
            scan,
            pool,
        } => {
            let mut cfg = FusionConfig::default();
            if let Some(depth) = depth {
                cfg.model.depth = depth;
            }
            if let Some(classes) = classes {
                cfg.model.num_classes = classes;
            }
            if let Some(cls_token) = cls_token {
                cfg.model.cls_token = cls_token;
            }
            if let Some(scan) = scan {
                cfg.model.scan = scan;
            }
            if let Some(pool) = pool {
                cfg.model.pool = pool;
            }
            init_config(&cfg, &out)?
        }
        Commands::Summary { config } => summary(&config)?,
        Commands::Infer {
            config,
            weights,
            batch,
            seed,
            features,
            random_cls,
        } => infer(&config, weights.as_deref(), batch, seed, features, random_cls)?,
        Commands::InitWeights { config, out } => init_weights(&config, &out)?,
    }

    println!("{}", "End".green());
    Ok(())
}

fn read_config(path: &Path) -> Result<FusionConfig> {
    FusionConfig::from_json(path).with_context(|| format!("failed to read config {}", path.display()))
}

fn init_config(cfg: &FusionConfig, out: &Path) -> Result<()> {
    cfg.validate().context("invalid config")?;
    cfg.to_json(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("Wrote {}", out.display().to_string().cyan());
    Ok(())
}

fn summary(config: &Path) -> Result<()> {
    let cfg = read_config(config)?;
    let (vs, model) = build_model(&cfg, Device::Cpu)?;

    println!(
        "{} depth {} | embed {} | tokens {} | classes {}",
        "Model".bold(),
        model.backbone().depth(),
        model.backbone().embed_dim(),
        cfg.conv_output_len(),
        cfg.model.num_classes,
    );

    for layer in model.backbone().layers() {
        println!(
            "  layers.{:<3} drop_path {:.3}",
            layer.layer_idx(),
            layer.drop_path().prob()
        );
    }

    let mut vars: Vec<_> = vs.variables().into_iter().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, tensor) in &vars {
        println!("  {:<48} {:?}", name, tensor.size());
    }
    println!("Parameters: {}", num_parameters(&vs).to_string().yellow());
    Ok(())
}

fn infer(
    config: &Path,
    weights: Option<&Path>,
    batch: i64,
    seed: i64,
    features: bool,
    random_cls: bool,
) -> Result<()> {
    tch::manual_seed(seed);
    let cfg = read_config(config)?;
    let device = Device::cuda_if_available();

    let (_vs, model) = match weights {
        Some(path) => load_model(path, &cfg, device)
            .with_context(|| format!("failed to load weights {}", path.display()))?,
        None => build_model(&cfg, device)?,
    };

    let xs = synthetic_csi(batch, cfg.in_channels, cfg.time_steps, 0).to_device(device);
    let opts = ForwardOptions {
        return_features: features,
        random_cls_position: random_cls,
        train: false,
    };
    let out = tch::no_grad(|| model.forward(&xs, opts, None));
    println!("Output shape: {:?}", out.size());

    if !features && out.dim() == 2 {
        let classes = out.argmax(-1, false).to_kind(Kind::Int64).to_device(Device::Cpu);
        for b in 0..batch {
            println!("  sample {b}: class {}", classes.int64_value(&[b]).to_string().green());
        }
    }
    Ok(())
}

fn init_weights(config: &Path, out: &Path) -> Result<()> {
    let cfg = read_config(config)?;
    let (vs, _model) = build_model(&cfg, Device::Cpu)?;
    save_weights(&vs, out).with_context(|| format!("failed to save {}", out.display()))?;
    println!(
        "Saved {} parameters to {}",
        num_parameters(&vs),
        out.display().to_string().cyan()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_rejects_non_positive_batch() {
        for batch in ["0", "-3"] {
            let parsed = Cli::try_parse_from(["wifi_bimamba", "infer", "--batch", batch]);
            assert!(parsed.is_err(), "batch {batch} was accepted");
        }
        let parsed = Cli::try_parse_from(["wifi_bimamba", "infer", "--batch", "4"]).unwrap();
        match parsed.command {
            Commands::Infer { batch, .. } => assert_eq!(batch, 4),
            _ => panic!("expected the infer subcommand"),
        }
    }
}

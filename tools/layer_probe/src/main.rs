use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};
use tracing::info;
use tracing_subscriber::EnvFilter;

use transformer_core::{apply_rotary_pos_emb, MixedFusedLayerNorm, NormConfig, RotaryConfig, RotaryEmbedding};

/// Runs the rotary embedding and fused layer norm on random activations and
/// reports shapes, kernel choice and timings.
#[derive(Parser)]
struct Cli {
    #[arg(short, long, default_value = "configs/layer_probe.yaml")]
    config: PathBuf,
    #[arg(long)]
    cpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProbeConfig {
    seq_len: i64,
    batch_size: i64,
    n_head: i64,
    head_dim: i64,
    rotary_percent: f64,
    seq_len_interpolation_factor: Option<f64>,
    offset: i64,
    use_rotary_in_fp32: bool,
    norm: NormConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            seq_len: 128,
            batch_size: 2,
            n_head: 16,
            head_dim: 64,
            rotary_percent: 1.0,
            seq_len_interpolation_factor: None,
            offset: 0,
            use_rotary_in_fp32: false,
            norm: NormConfig::new(1024),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config: ProbeConfig = if cli.config.exists() {
        let content = fs::read_to_string(&cli.config)?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse probe config {:?}", cli.config))?
    } else {
        info!(path = ?cli.config, "config not found, using defaults");
        ProbeConfig::default()
    };

    let hidden = config.n_head * config.head_dim;
    ensure!(
        config.norm.normalized_shape.iter().product::<i64>() == hidden,
        "norm shape {:?} does not cover hidden size {}",
        config.norm.normalized_shape,
        hidden
    );

    let device = if cli.cpu { Device::Cpu } else { Device::cuda_if_available() };
    info!(?device, "using device");

    // [seq, batch, hidden] activations, the sequence-first layout
    let hidden_states = Tensor::randn(&[config.seq_len, config.batch_size, hidden], (Kind::Float, device));

    let vs = nn::VarStore::new(device);
    let norm = MixedFusedLayerNorm::new(&(vs.root() / "input_layernorm"), &config.norm)?;
    info!(mode = ?norm.mode(), persistent = norm.is_persistent(), "layer norm ready");

    let start = Instant::now();
    let normed = norm.f_forward(&hidden_states)?;
    info!(shape = ?normed.size(), elapsed = ?start.elapsed(), "layer norm forward");

    let rotary_config = RotaryConfig {
        seq_len_interpolation_factor: config.seq_len_interpolation_factor,
        ..RotaryConfig::from_head_dim(config.head_dim, config.rotary_percent)
    };
    let mut rotary = RotaryEmbedding::new(&rotary_config, device)?;

    let start = Instant::now();
    let freqs = rotary.forward(config.seq_len, config.offset, config.use_rotary_in_fp32)?;
    let query = normed.view([config.seq_len, config.batch_size, config.n_head, config.head_dim]);
    let rotated = apply_rotary_pos_emb(&query, &freqs)?;
    info!(
        rotary_dim = rotary.dim(),
        freqs = ?freqs.size(),
        shape = ?rotated.size(),
        elapsed = ?start.elapsed(),
        "rotary embedding applied"
    );

    let drift = (rotated.square().sum(Kind::Float) - query.square().sum(Kind::Float))
        .abs()
        .double_value(&[]);
    info!(drift, "total energy drift after rotation");

    Ok(())
}

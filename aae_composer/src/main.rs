// AAE Composer CLI entry point.
//
// Learns from one or more MIDI files and writes a new composition.
// The pipeline: extraction -> optional CAE pretraining -> adversarial
// training -> composition -> dissonance report.
//
// Usage:
//   aae-compose song1.mid song2.mid --output out.mid [--config composer.toml]
//     [--iterations N] [--k-step N] [--seed N] [--pretrain]
//     [--velocity-mean V] [--velocity-std V] [--logs logs.json]
//
// Set RUST_LOG=debug for per-iteration losses.

use aae_composer::dissonance;
use aae_composer::{AaeComposer, ComposerConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aae-compose")]
#[command(version, about = "Compose MIDI with adversarial autoencoders")]
struct Args {
    /// MIDI files to learn from
    #[arg(required = true)]
    midi: Vec<PathBuf>,

    /// Where to write the composed MIDI file
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// TOML configuration (defaults are used for missing fields)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Adversarial training iterations (overrides training.iter_n)
    #[arg(long)]
    iterations: Option<usize>,

    /// Discriminator updates per iteration (overrides training.k_step)
    #[arg(long)]
    k_step: Option<usize>,

    /// Random seed (overrides the config seed)
    #[arg(long)]
    seed: Option<u64>,

    /// Pretrain the generator's autoencoder before adversarial training
    #[arg(long)]
    pretrain: bool,

    /// Mean velocity of composed notes (default: corpus mean)
    #[arg(long)]
    velocity_mean: Option<f64>,

    /// Velocity standard deviation (default: spread of per-file stds)
    #[arg(long)]
    velocity_std: Option<f64>,

    /// Write training logs as JSON
    #[arg(long)]
    logs: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ComposerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ComposerConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    let iter_n = args.iterations.unwrap_or(config.training.iter_n);
    let k_step = args.k_step.unwrap_or(config.training.k_step);
    let time_fraction = config.time_fraction;

    println!("=== AAE Composer ===");
    println!("Inputs: {}", args.midi.len());
    println!("Output: {}", args.output.display());
    println!("Seed: {}", config.seed);
    println!("Iterations: {iter_n} (k_step {k_step})");

    let mut composer =
        AaeComposer::new(&args.midi, config).context("building composer from MIDI input")?;
    println!("Programs: {:?}", composer.program_list());

    if args.pretrain {
        let history = composer.pretrain().context("pretraining autoencoder")?;
        if let Some(last) = history.train.last() {
            println!("Pretraining: {} epochs, final error {last:.6}", history.train.len());
        }
    }

    composer
        .learn(iter_n, k_step)
        .context("adversarial training")?;

    let logs = composer.extract_logs();
    if let Some(path) = &args.logs {
        let json = serde_json::to_string_pretty(logs).context("serializing training logs")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing training logs to {}", path.display()))?;
        println!("Logs: {}", path.display());
    }
    if let (Some(rec), Some(d), Some(g)) = (
        logs.reconstruction_errors.last(),
        logs.discriminator_posteriors.last(),
        logs.generator_posteriors.last(),
    ) {
        println!("Final reconstruction error: {rec:.6}");
        println!("Final posterior on generated bars: D turn {d:.4}, G turn {g:.4}");
    }

    let table = composer
        .compose(&args.output, args.velocity_mean, args.velocity_std)
        .with_context(|| format!("composing to {}", args.output.display()))?;
    let report = dissonance::analyze(&table, time_fraction);

    println!("\n=== Composition ===");
    println!("Notes: {}", table.len());
    println!("Duration: {:.1}s", table.duration());
    println!(
        "Dissonance ratio: {:.3} ({} of {} simultaneous pairs)",
        report.ratio(),
        report.dissonant_pairs,
        report.pairs
    );
    println!("Written to {}", args.output.display());
    Ok(())
}

use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use cifar_training::{Trainer, TrainingConfig, TrainingError};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "CIFAR-10 training CLI", long_about = None)]
struct Args {
    #[arg(long, value_name = "LR", help = "Learning rate (default 0.1)")]
    lr: Option<f64>,

    #[arg(short, long, help = "Resume from checkpoint")]
    resume: bool,

    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Optional TOML or JSON training config"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "N", help = "Number of epochs to run")]
    epochs: Option<usize>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_config(args: &Args) -> Result<TrainingConfig, TrainingError> {
    let config = match &args.config {
        Some(path) => TrainingConfig::from_path(path)?,
        None => TrainingConfig::default(),
    };
    let overrides: Vec<(String, String)> = args
        .overrides
        .iter()
        .map(|arg| (arg.path.clone(), arg.value.clone()))
        .collect();
    let mut config = config.with_overrides(&overrides)?;
    if let Some(lr) = args.lr {
        config.optimizer.learning_rate = lr;
    }
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = epochs;
    }
    config.validate()?;
    Ok(config)
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    let mut trainer = Trainer::new(config)?;

    if args.resume {
        info!("resuming from checkpoint");
        if let Some(path) = trainer.resume()? {
            info!(path = %path.display(), next_epoch = trainer.state().epoch + 1, "checkpoint restored");
        }
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let state = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    info!(
        epoch = state.epoch,
        best_acc = format_args!("{:.3}%", state.best_acc),
        "training finished"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("train").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn config_file_learning_rate_survives_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "[optimizer]\nlearning_rate = 0.01\n").unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = resolve_config(&args(&["--config", &path])).unwrap();
        assert_eq!(config.optimizer.learning_rate, 0.01);

        let config = resolve_config(&args(&["--config", &path, "--lr", "0.2"])).unwrap();
        assert_eq!(config.optimizer.learning_rate, 0.2);
    }

    #[test]
    fn override_learning_rate_survives_without_flag() {
        let config =
            resolve_config(&args(&["--override", "optimizer.learning_rate=0.05"])).unwrap();
        assert_eq!(config.optimizer.learning_rate, 0.05);

        let config = resolve_config(&args(&[])).unwrap();
        assert_eq!(config.optimizer.learning_rate, 0.1);
    }
}

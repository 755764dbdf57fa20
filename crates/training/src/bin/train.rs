use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use lai_training::{
    apply_overrides, build_model, config::parse_override_arg, select_device,
    ReferencePanelDataLoader, Trainer, TrainingConfig, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Local ancestry inference training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        value_parser = parse_override_arg,
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<(String, String)>,

    #[arg(long, help = "Resume from the last completed epoch of the experiment")]
    resume: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.resume {
        config.runtime.resume = true;
    }
    config.ensure_prerequisites()?;

    let device = select_device(config.runtime.device, config.runtime.device_ordinal);

    let train_loader = ReferencePanelDataLoader::from_config(
        &config.data,
        &config.data.train_mixed,
        config.data.shuffle,
        config.runtime.seed,
    )?;
    let valid_loader = ReferencePanelDataLoader::from_config(
        &config.data,
        &config.data.valid_mixed,
        false,
        config.runtime.seed,
    )?;
    let seq_len = train_loader.dataset().seq_len();
    if valid_loader.dataset().seq_len() != seq_len {
        return Err(TrainingError::initialization(format!(
            "training haplotypes have {} positions but validation haplotypes have {}",
            seq_len,
            valid_loader.dataset().seq_len()
        )));
    }

    let model = build_model(&config.model, seq_len, &device)?;
    let mut trainer = Trainer::new(config, model, train_loader, valid_loader, device)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    if summary.interrupted {
        log::warn!(
            "stopped after {} epochs; rerun with --resume to continue",
            summary.epochs_run
        );
    }
    log::info!(
        "ran {} epochs from epoch {} ({} optimizer steps); best epoch {:?} val_acc={:.4} val_loss={:.4}",
        summary.epochs_run,
        summary.first_epoch,
        summary.optimizer_steps,
        summary.best_epoch,
        summary.best_val_acc,
        summary.best_val_loss
    );

    Ok(())
}

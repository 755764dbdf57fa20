use std::path::PathBuf;

use clap::Parser;
use lai_training::{
    apply_model_weights, build_model, select_device, validate, BlockingDataLoader,
    CheckpointStore, CrossEntropyLoss, ReferencePanelDataLoader, TrainingConfig, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("validation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Score a trained ancestry model on labeled haplotypes", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        help = "Model weights; defaults to the experiment's best model"
    )]
    model_cp: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Labeled haplotypes; defaults to data.test_mixed, then data.valid_mixed"
    )]
    test_mixed: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)?;

    let weights = match args.model_cp {
        Some(path) => path,
        None => CheckpointStore::new(&config.experiment.dir).verified_best_model()?,
    };
    let mixed = args
        .test_mixed
        .or_else(|| config.data.test_mixed.clone())
        .unwrap_or_else(|| config.data.valid_mixed.clone());

    let device = select_device(config.runtime.device, config.runtime.device_ordinal);
    let loader =
        ReferencePanelDataLoader::from_config(&config.data, &mixed, false, config.runtime.seed)?;
    let model = build_model(&config.model, loader.dataset().seq_len(), &device)?;
    apply_model_weights(&model, &weights)?;
    log::info!("scoring {} with weights {}", mixed.display(), weights.display());

    let mut loader = BlockingDataLoader::new(loader);
    let summary = validate(&model, &mut loader, &CrossEntropyLoss::new(), &device)?;
    println!(
        "accuracy={:.4} loss={:.4} samples={}",
        summary.accuracy, summary.average_loss, summary.samples
    );
    Ok(())
}

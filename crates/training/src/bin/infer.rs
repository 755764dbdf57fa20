use std::{fs::File, io::BufWriter, path::PathBuf};

use clap::Parser;
use lai_training::{
    apply_model_weights, build_model, ibd_segments, inference, select_device,
    BlockingDataLoader, ReferencePanelDataLoader, TrainingConfig, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("inference failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Predict local ancestry and IBD segments", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(long, value_name = "PATH", help = "Model weights to load")]
    model_cp: PathBuf,

    #[arg(long, value_name = "PATH", help = "Haplotypes to annotate (labels optional)")]
    test_mixed: PathBuf,

    #[arg(long, value_name = "PATH", help = "Output safetensors file")]
    output: PathBuf,

    #[arg(
        long,
        default_value_t = 1,
        help = "Shortest IBD run, in windows, written to the segment file"
    )]
    min_ibd_windows: usize,

    #[arg(long, value_name = "PATH", help = "Optional JSON file for decoded IBD segments")]
    segments: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)?;

    let device = select_device(config.runtime.device, config.runtime.device_ordinal);
    let loader = ReferencePanelDataLoader::from_config(
        &config.data,
        &args.test_mixed,
        false,
        config.runtime.seed,
    )?;
    let model = build_model(&config.model, loader.dataset().seq_len(), &device)?;
    apply_model_weights(&model, &args.model_cp)?;

    let mut loader = BlockingDataLoader::new(loader);
    let output = inference(&model, &mut loader, &device)?;
    output.save(&args.output)?;
    log::info!(
        "wrote predictions for {} samples to {}",
        output.samples(),
        args.output.display()
    );

    if let Some(path) = args.segments.as_ref() {
        let mut segments = ibd_segments(&output.ibd, args.min_ibd_windows)?;
        if let Some(rows) = output.sample_idx.as_ref() {
            for segment in &mut segments {
                segment.sample = rows[segment.sample];
            }
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &segments).map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
        })?;
        log::info!("wrote {} IBD segments to {}", segments.len(), path.display());
    }
    Ok(())
}

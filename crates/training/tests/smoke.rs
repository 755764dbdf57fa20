use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use candle_core::{Device, Tensor};
use lai_model::{AgnosticModel, LaiModel};
use lai_training::{
    apply_model_weights, build_model, inference, validate, BlockingDataLoader, CheckpointStore,
    CrossEntropyLoss, ReferencePanelDataLoader, Trainer, TrainingConfig, TrainingError,
    TrainingState,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

const SEQ_LEN: usize = 12;
const WINDOW: usize = 4;
const REFS_PER_CLASS: usize = 3;

/// Two ancestries of random haplotypes; query samples are window-wise mosaics of them.
fn reference_panel(rng: &mut StdRng) -> (Vec<Vec<f32>>, Vec<u32>) {
    let mut haplotypes = Vec::new();
    let mut labels = Vec::new();
    for class in 0..2u32 {
        for _ in 0..REFS_PER_CLASS {
            haplotypes.push(
                (0..SEQ_LEN)
                    .map(|_| if rng.gen_bool(0.5) { 1.0 } else { -1.0 })
                    .collect(),
            );
            labels.push(class);
        }
    }
    (haplotypes, labels)
}

fn write_reference(path: &Path, haplotypes: &[Vec<f32>], labels: &[u32]) -> Result<()> {
    let mut tensors = HashMap::new();
    tensors.insert(
        "snps".to_string(),
        Tensor::from_vec(haplotypes.concat(), (haplotypes.len(), SEQ_LEN), &Device::Cpu)?,
    );
    tensors.insert(
        "labels".to_string(),
        Tensor::from_vec(labels.to_vec(), labels.len(), &Device::Cpu)?,
    );
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

fn write_mixed(
    path: &Path,
    samples: usize,
    rng: &mut StdRng,
    haplotypes: &[Vec<f32>],
    labels: &[u32],
) -> Result<()> {
    let mut snps = Vec::with_capacity(samples * SEQ_LEN);
    let mut ancestry = Vec::with_capacity(samples * SEQ_LEN);
    for _ in 0..samples {
        for window in 0..SEQ_LEN / WINDOW {
            let source = rng.gen_range(0..haplotypes.len());
            for position in window * WINDOW..(window + 1) * WINDOW {
                let value = haplotypes[source][position];
                snps.push(if rng.gen_bool(0.1) { -value } else { value });
                ancestry.push(labels[source]);
            }
        }
    }
    let mut tensors = HashMap::new();
    tensors.insert(
        "snps".to_string(),
        Tensor::from_vec(snps, (samples, SEQ_LEN), &Device::Cpu)?,
    );
    tensors.insert(
        "labels".to_string(),
        Tensor::from_vec(ancestry, (samples, SEQ_LEN), &Device::Cpu)?,
    );
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Writes datasets and a config file into a fresh directory.
fn fixture(train_samples: usize, batch_size: usize, extra: &str) -> Result<(TempDir, TrainingConfig)> {
    let dir = tempdir()?;
    let mut rng = StdRng::seed_from_u64(2024);
    let (haplotypes, labels) = reference_panel(&mut rng);
    write_reference(&dir.path().join("ref.safetensors"), &haplotypes, &labels)?;
    write_mixed(
        &dir.path().join("train.safetensors"),
        train_samples,
        &mut rng,
        &haplotypes,
        &labels,
    )?;
    write_mixed(&dir.path().join("valid.safetensors"), 4, &mut rng, &haplotypes, &labels)?;
    write_mixed(&dir.path().join("test.safetensors"), 7, &mut rng, &haplotypes, &labels)?;

    let config = format!(
        r#"
        [experiment]
        dir = "exp"

        [data]
        train_mixed = "train.safetensors"
        valid_mixed = "valid.safetensors"
        test_mixed = "test.safetensors"
        reference_panel = "ref.safetensors"
        batch_size = {batch_size}
        n_refs = 2

        [model]
        n_classes = 2
        window_size = {WINDOW}
        smoother_kernel = 3
        seed = 5

        [optimizer]
        learning_rate = 0.05

        [runtime]
        num_epochs = 4
        seed = 11
        device = "cpu"
        log_every_n_steps = 1

        [runtime.logging]
        enable_stdout = false

        {extra}
        "#
    );
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, config)?;
    let config = TrainingConfig::load(&config_path)?;
    Ok((dir, config))
}

fn loader(config: &TrainingConfig, mixed: &Path, shuffle: bool) -> Result<ReferencePanelDataLoader> {
    Ok(ReferencePanelDataLoader::from_config(
        &config.data,
        mixed,
        shuffle,
        config.runtime.seed,
    )?)
}

fn trainer(config: &TrainingConfig) -> Result<Trainer<AgnosticModel, ReferencePanelDataLoader>> {
    let train = loader(config, &config.data.train_mixed, config.data.shuffle)?;
    let valid = loader(config, &config.data.valid_mixed, false)?;
    let model = build_model(&config.model, SEQ_LEN, &Device::Cpu)?;
    Ok(Trainer::new(config.clone(), model, train, valid, Device::Cpu)?)
}

fn weights(model: &AgnosticModel) -> Result<Vec<Vec<f32>>> {
    model
        .parameters()
        .into_iter()
        .map(|(_, var)| Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?))
        .collect()
}

#[test]
fn resumed_run_matches_uninterrupted_run() -> Result<()> {
    let (_full_dir, full_config) = fixture(8, 2, "")?;
    let mut full = trainer(&full_config)?;
    let full_summary = full.train()?;
    assert_eq!(full.state(), TrainingState::Completed);
    assert_eq!(full_summary.epochs_run, 4);

    let (_split_dir, mut split_config) = fixture(8, 2, "")?;
    split_config.runtime.num_epochs = 2;
    let mut first_half = trainer(&split_config)?;
    first_half.train()?;
    drop(first_half);

    split_config.runtime.num_epochs = 4;
    split_config.runtime.resume = true;
    let mut second_half = trainer(&split_config)?;
    let resumed = second_half.train()?;
    assert_eq!(resumed.first_epoch, 2);
    assert_eq!(resumed.epochs_run, 2);

    let epochs: Vec<usize> = second_half.progress().iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![0, 1, 2, 3]);
    assert_eq!(resumed.best_epoch, full_summary.best_epoch);
    assert_eq!(resumed.optimizer_steps, full_summary.optimizer_steps);
    for (left, right) in full.progress().iter().zip(second_half.progress()) {
        assert!((left.val_acc - right.val_acc).abs() < 1e-9);
        assert!((left.train_loss - right.train_loss).abs() < 1e-6);
    }
    assert!(second_half.progress()[3].time >= second_half.progress()[1].time);

    let full_weights = weights(full.model())?;
    let resumed_weights = weights(second_half.model())?;
    for (left, right) in full_weights.iter().flatten().zip(resumed_weights.iter().flatten()) {
        assert!((left - right).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn optimizer_steps_once_per_full_accumulation_group() -> Result<()> {
    let (_dir, mut config) = fixture(8, 1, "")?;
    config.runtime.num_epochs = 1;
    config.runtime.update_every = 4;
    let mut eight_batches = trainer(&config)?;
    assert_eq!(eight_batches.train()?.optimizer_steps, 2);

    let (_dir, mut config) = fixture(10, 1, "")?;
    config.runtime.num_epochs = 1;
    config.runtime.update_every = 4;
    let mut ten_batches = trainer(&config)?;
    assert_eq!(ten_batches.train()?.optimizer_steps, 2);
    Ok(())
}

#[test]
fn best_checkpoint_tracks_highest_validation_accuracy() -> Result<()> {
    let (_dir, mut config) = fixture(8, 2, "[scheduler]\nlr_decay = 2\ngamma = 0.5")?;
    config.runtime.num_epochs = 5;
    let mut run = trainer(&config)?;
    let summary = run.train()?;

    let records = run.progress();
    for pair in records.windows(2) {
        assert!(pair[1].best_val_acc >= pair[0].best_val_acc);
    }
    let last = records.last().expect("records");
    assert_eq!(summary.best_epoch, Some(last.best_epoch));
    assert!((records[4].lr - 0.05 * 0.25).abs() < 1e-12);

    let store = CheckpointStore::new(&config.experiment.dir);
    let best = store.best_manifest()?.expect("best manifest");
    assert_eq!(best.epoch, last.best_epoch);

    let model = build_model(&config.model, SEQ_LEN, &Device::Cpu)?;
    apply_model_weights(&model, &store.verified_best_model()?)?;
    let mut valid = BlockingDataLoader::new(loader(&config, &config.data.valid_mixed, false)?);
    let rescored = validate(&model, &mut valid, &CrossEntropyLoss::new(), &Device::Cpu)?;
    assert!((rescored.accuracy - records[last.best_epoch].val_acc).abs() < 1e-9);
    assert!(model.is_training());
    Ok(())
}

#[test]
fn inference_rows_follow_loader_order() -> Result<()> {
    let (_dir, config) = fixture(8, 3, "")?;
    let test_mixed = config.data.test_mixed.clone().expect("test split");
    let model = build_model(&config.model, SEQ_LEN, &Device::Cpu)?;

    let mut batched = BlockingDataLoader::new(loader(&config, &test_mixed, false)?);
    let output = inference(&model, &mut batched, &Device::Cpu)?;
    assert_eq!(output.predictions.dims(), &[7, SEQ_LEN]);
    assert_eq!(output.predictions_window.dims(), &[7, SEQ_LEN / WINDOW]);
    assert_eq!(output.ibd.dims(), &[7, SEQ_LEN / WINDOW]);
    assert_eq!(output.sample_idx, Some((0..7).collect()));

    let mut config_single = config.clone();
    config_single.data.batch_size = 1;
    let mut single = BlockingDataLoader::new(loader(&config_single, &test_mixed, false)?);
    let one_by_one = inference(&model, &mut single, &Device::Cpu)?;
    assert_eq!(
        output.predictions.to_vec2::<u32>()?,
        one_by_one.predictions.to_vec2::<u32>()?
    );
    assert_eq!(output.ibd.to_vec2::<i64>()?, one_by_one.ibd.to_vec2::<i64>()?);

    let ids = output.ibd.to_vec2::<i64>()?;
    let total_refs = (2 * REFS_PER_CLASS) as i64;
    assert!(ids.iter().flatten().all(|&id| id == -1 || (0..total_refs).contains(&id)));
    Ok(())
}

#[test]
fn stop_request_ends_between_epochs() -> Result<()> {
    let (_dir, config) = fixture(8, 2, "")?;
    let mut run = trainer(&config)?;
    let mut checks = 0;
    let summary = run.train_with_shutdown(|| {
        checks += 1;
        checks > 1
    })?;
    assert!(summary.interrupted);
    assert_eq!(summary.epochs_run, 1);
    assert_eq!(run.progress().len(), 1);
    assert_eq!(run.state(), TrainingState::Stopped(1));
    Ok(())
}

#[test]
fn resume_without_history_fails() -> Result<()> {
    let (_dir, mut config) = fixture(8, 2, "")?;
    config.runtime.resume = true;
    let mut run = trainer(&config)?;
    assert!(matches!(run.train(), Err(TrainingError::Resume(_))));
    Ok(())
}

#[test]
fn resume_rejects_checkpoint_from_another_epoch() -> Result<()> {
    let (_dir, mut config) = fixture(8, 2, "")?;
    config.runtime.num_epochs = 2;
    trainer(&config)?.train()?;

    let progress_path = config.experiment.dir.join("progress.jsonl");
    let contents = fs::read_to_string(&progress_path)?;
    let first_line = contents.lines().next().expect("progress line");
    fs::write(&progress_path, format!("{first_line}\n"))?;

    config.runtime.resume = true;
    config.runtime.num_epochs = 3;
    let mut run = trainer(&config)?;
    assert!(matches!(run.train(), Err(TrainingError::Resume(_))));
    Ok(())
}

#[test]
fn trains_with_fewer_windows_than_smoother_taps() -> Result<()> {
    for window_size in [6, SEQ_LEN] {
        let (_dir, mut config) = fixture(4, 2, "")?;
        config.model.window_size = window_size;
        config.runtime.num_epochs = 1;
        let mut run = trainer(&config)?;
        let summary = run.train()?;
        assert_eq!(summary.epochs_run, 1);
        assert_eq!(summary.optimizer_steps, 2);
    }
    Ok(())
}

#[test]
fn non_finite_training_loss_aborts_the_run() -> Result<()> {
    let (_dir, mut config) = fixture(4, 2, "")?;
    config.runtime.num_epochs = 1;

    let train_path = config.data.train_mixed.clone();
    let mut tensors = candle_core::safetensors::load(&train_path, &Device::Cpu)?;
    let snps = tensors.remove("snps").expect("snps tensor");
    let mut values = snps.flatten_all()?.to_vec1::<f32>()?;
    values[0] = f32::NAN;
    tensors.insert(
        "snps".to_string(),
        Tensor::from_vec(values, snps.dims(), &Device::Cpu)?,
    );
    candle_core::safetensors::save(&tensors, &train_path)?;

    let mut run = trainer(&config)?;
    match run.train() {
        Err(TrainingError::NumericDivergence { context, value }) => {
            assert!(context.contains("epoch 0"));
            assert!(value.is_nan());
        }
        other => panic!("expected numeric divergence, got {other:?}"),
    }
    assert!(run.progress().is_empty());
    Ok(())
}

mod common;

use std::fs;

use flow_trainer::{
    RunConfig, TrainErr, Trainer,
    metrics::{MetricRecord, MetricValue},
    trainer::Phase,
};
use ndarray::ArrayD;
use serde_json::json;

fn scalar(record: &MetricRecord, name: &str) -> f64 {
    match record.get(name) {
        Some(MetricValue::Scalar(v)) => *v,
        other => panic!("expected a scalar `{name}`, got {other:?}"),
    }
}

/// Feeds `batches` and returns the record of the last completed window.
fn feed(trainer: &mut Trainer, batches: &[ArrayD<f32>]) -> Option<MetricRecord> {
    let mut last = None;
    for batch in batches {
        if let Some(record) = trainer.micro_step(batch.clone()).unwrap() {
            last = Some(record);
        }
    }

    last
}

fn batches(config: &RunConfig, n: usize) -> Vec<ArrayD<f32>> {
    let mut source = common::source(config);
    (0..n).map(|_| common::next(source.as_mut())).collect()
}

fn with_cosine(mut config: RunConfig) -> RunConfig {
    config.train.scheduler = Some("cosine".into());
    config.train.scheduler_kwargs = json!({"warmup_steps": 2, "total_steps": 20})
        .as_object()
        .unwrap()
        .clone();
    config
}

/// Trains `windows` updates and saves them.
fn trained(config: &RunConfig, windows: usize) -> (Trainer, std::path::PathBuf) {
    let mut source = common::source(config);
    let mut trainer = common::prepared_trainer(config.clone());

    for _ in 0..windows * config.train.accumulation_steps() {
        trainer.micro_step(common::next(source.as_mut())).unwrap();
    }

    let path = trainer.save_checkpoint().unwrap();
    (trainer, path)
}

fn assert_untouched(trainer: &Trainer, fresh: &Trainer) {
    assert_eq!(trainer.phase(), Phase::Ready);
    assert_eq!(trainer.steps(), 0);
    assert_eq!(trainer.params(), fresh.params());
    assert_eq!(trainer.ema_params(), fresh.ema_params());
    assert_eq!(trainer.optimizer_state(), fresh.optimizer_state());
    assert_eq!(trainer.scaler_state(), fresh.scaler_state());
    assert_eq!(trainer.lr(), fresh.lr());
}

#[test]
fn round_trip_restores_every_part() {
    let dir = common::temp_dir("ckpt_round_trip");
    let config = with_cosine(common::small_config(&dir));
    let (trainer, path) = trained(&config, 3);

    assert_eq!(trainer.steps(), 3);
    assert_eq!(path, dir.join("step_3.safetensors"));
    assert!(!dir.join(".step_3.safetensors.tmp").exists());

    let mut resumed = common::prepared_trainer(config);
    assert_ne!(resumed.params(), trainer.params());
    resumed.load_checkpoint(&path).unwrap();

    assert_eq!(resumed.steps(), 3);
    assert_eq!(resumed.phase(), Phase::Ready);
    assert_eq!(resumed.params(), trainer.params());
    assert_eq!(resumed.ema_params(), trainer.ema_params());
    assert_eq!(resumed.optimizer_state(), trainer.optimizer_state());
    assert_eq!(resumed.scaler_state(), trainer.scaler_state());
    assert_eq!(resumed.lr(), trainer.lr());
}

#[test]
fn resume_ckpt_is_loaded_at_preparation() {
    let dir = common::temp_dir("ckpt_resume");
    let mut config = common::small_config(&dir);
    let (trainer, path) = trained(&config, 2);

    config.train.resume_ckpt = Some(path);
    let resumed = common::prepared_trainer(config);

    assert_eq!(resumed.steps(), 2);
    assert_eq!(resumed.params(), trainer.params());
}

#[test]
fn corrupt_files_leave_the_trainer_untouched() {
    let dir = common::temp_dir("ckpt_corrupt");
    let config = common::small_config(&dir);
    let (_, path) = trained(&config, 1);

    let garbage = dir.join("garbage.safetensors");
    fs::write(&garbage, b"definitely not a checkpoint").unwrap();

    let bytes = fs::read(&path).unwrap();
    let truncated = dir.join("truncated.safetensors");
    fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();

    let fresh = common::prepared_trainer(config.clone());
    let mut trainer = common::prepared_trainer(config);

    for bad in [garbage, truncated, dir.join("missing.safetensors")] {
        let result = trainer.load_checkpoint(&bad);
        assert!(matches!(result, Err(TrainErr::Checkpoint(_))), "{bad:?} gave {result:?}");
        assert_untouched(&trainer, &fresh);
    }
}

#[test]
fn checkpoints_of_another_model_are_rejected() {
    let dir = common::temp_dir("ckpt_other_model");
    let config = common::small_config(&dir);
    let (_, path) = trained(&config, 1);

    let mut wider = config.clone();
    wider.model.d_model = 32;

    let fresh = common::prepared_trainer(wider.clone());
    let mut trainer = common::prepared_trainer(wider);

    assert!(matches!(trainer.load_checkpoint(&path), Err(TrainErr::Checkpoint(_))));
    assert_untouched(&trainer, &fresh);
}

#[test]
fn missing_scheduler_state_fails_before_anything_is_applied() {
    let dir = common::temp_dir("ckpt_scheduler");
    let config = common::small_config(&dir);
    let (_, path) = trained(&config, 2);

    let scheduled = with_cosine(config);
    let fresh = common::prepared_trainer(scheduled.clone());
    let mut trainer = common::prepared_trainer(scheduled);

    assert!(trainer.load_checkpoint(&path).is_err());
    assert_untouched(&trainer, &fresh);
}

#[test]
fn loading_needs_a_prepared_trainer() {
    let dir = common::temp_dir("ckpt_phase");
    let config = common::small_config(&dir);
    let (_, path) = trained(&config, 1);

    let mut trainer = Trainer::new(config, std::sync::Arc::new(flow_trainer::collective::SingleProcess)).unwrap();
    assert!(matches!(
        trainer.load_checkpoint(&path),
        Err(TrainErr::InvalidPhase { .. })
    ));
}

#[test]
fn resumed_training_follows_the_original_path() {
    let dir = common::temp_dir("ckpt_same_path");
    let mut config = with_cosine(common::small_config(&dir));
    config.train.scaler.growth_interval = 2;
    config.train.ema.update_after_step = 1;

    let accumulation = config.train.accumulation_steps();
    let batches = batches(&config, 4 * accumulation);
    let (before, after) = batches.split_at(3 * accumulation);

    let mut original = common::prepared_trainer(config.clone());
    feed(&mut original, before).unwrap();
    let path = original.save_checkpoint().unwrap();

    let mut resumed = common::prepared_trainer(config);
    resumed.load_checkpoint(&path).unwrap();

    let expected = feed(&mut original, after).unwrap();
    let got = feed(&mut resumed, after).unwrap();

    assert_eq!(got.step, 3);
    assert_eq!(got.step, expected.step);
    for name in ["diffusion_loss", "loss_scale", "lr"] {
        assert_eq!(scalar(&got, name), scalar(&expected, name), "{name}");
    }

    // The fourth clean window grows the scale again.
    assert_eq!(scalar(&got, "loss_scale"), 65_536.0 * 4.0);

    assert_eq!(resumed.steps(), original.steps());
    assert_eq!(resumed.params(), original.params());
    assert_eq!(resumed.ema_params(), original.ema_params());
    assert_eq!(resumed.optimizer_state(), original.optimizer_state());
    assert_eq!(resumed.scaler_state(), original.scaler_state());
    assert_eq!(resumed.lr(), original.lr());
}

#[test]
fn loading_discards_a_partial_window() {
    let dir = common::temp_dir("ckpt_partial_window");
    let config = common::small_config(&dir);
    let (_, path) = trained(&config, 1);

    let batches = batches(&config, 3);

    let mut clean = common::prepared_trainer(config.clone());
    clean.load_checkpoint(&path).unwrap();

    let mut interrupted = common::prepared_trainer(config);
    assert!(interrupted.micro_step(batches[0].clone()).unwrap().is_none());
    interrupted.load_checkpoint(&path).unwrap();

    let expected = feed(&mut clean, &batches[1..]).unwrap();
    let got = feed(&mut interrupted, &batches[1..]).unwrap();

    assert_eq!(scalar(&got, "diffusion_loss"), scalar(&expected, "diffusion_loss"));
    assert_eq!(interrupted.params(), clean.params());
    assert_eq!(interrupted.steps(), 2);
}

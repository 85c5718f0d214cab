mod common;

use std::{fs, sync::Arc};

use flow_trainer::{
    TrainErr, Trainer,
    autoencoder::Autoencoder,
    collective::SingleProcess,
    config::SinkKind,
    metrics::MetricValue,
    trainer::Phase,
};
use ndarray::{ArrayD, ArrayViewD};

/// Encodes as the identity but can't decode.
struct BrokenDecoder;

impl Autoencoder for BrokenDecoder {
    fn encode(&self, x: ArrayViewD<f32>) -> flow_trainer::Result<ArrayD<f32>> {
        Ok(x.to_owned())
    }

    fn decode(&self, _z: ArrayViewD<f32>) -> flow_trainer::Result<ArrayD<f32>> {
        Err(TrainErr::Autoencoder("decoder unavailable".into()))
    }

    fn scale(&self) -> f32 {
        1.0
    }
}

#[test]
fn ema_changes_once_per_window() {
    let dir = common::temp_dir("accumulation");
    let config = common::small_config(&dir);
    let mut source = common::source(&config);
    let mut trainer = common::prepared_trainer(config);
    assert_eq!(trainer.phase(), Phase::Ready);

    let ema_before = trainer.ema_params().unwrap().to_vec();
    let params_before = trainer.params().to_vec();

    let first = trainer.micro_step(common::next(source.as_mut())).unwrap();
    assert!(first.is_none());
    assert_eq!(trainer.steps(), 0);
    assert_eq!(trainer.params(), params_before.as_slice());
    assert_eq!(trainer.ema_params().unwrap(), ema_before.as_slice());

    let record = trainer
        .micro_step(common::next(source.as_mut()))
        .unwrap()
        .unwrap();
    assert_eq!(record.step, 0);
    assert_eq!(trainer.steps(), 1);
    assert_ne!(trainer.params(), params_before.as_slice());

    let ema_after = trainer.ema_params().unwrap().to_vec();
    assert_ne!(ema_after, ema_before);
    assert_eq!(ema_after.as_slice(), trainer.params());

    let third = trainer.micro_step(common::next(source.as_mut())).unwrap();
    assert!(third.is_none());
    assert_eq!(trainer.ema_params().unwrap(), ema_after.as_slice());
}

#[test]
fn window_record_carries_the_training_metrics() {
    let dir = common::temp_dir("window_record");
    let config = common::small_config(&dir);
    let mut source = common::source(&config);
    let mut trainer = common::prepared_trainer(config);

    trainer.micro_step(common::next(source.as_mut())).unwrap();
    let record = trainer
        .micro_step(common::next(source.as_mut()))
        .unwrap()
        .unwrap();

    let Some(MetricValue::Scalar(loss)) = record.get("diffusion_loss") else {
        panic!("missing diffusion_loss in {record:?}");
    };
    assert!(loss.is_finite() && *loss >= 0.0);

    assert_eq!(record.get("skipped_step"), Some(&MetricValue::Scalar(0.0)));
    assert_eq!(record.get("loss_scale"), Some(&MetricValue::Scalar(65_536.0)));
    assert!(matches!(record.get("lr"), Some(MetricValue::Scalar(_))));
    assert!(matches!(record.get("grad_norm"), Some(MetricValue::Scalar(_))));

    match record.get("samples") {
        Some(MetricValue::Media { shape, data }) => {
            assert_eq!(shape, &[2, 2, 4, 4]);
            assert_eq!(data.len(), 64);
        }
        other => panic!("expected samples on the first window, got {other:?}"),
    }
}

#[test]
fn max_steps_stops_training() {
    let dir = common::temp_dir("max_steps");
    let mut config = common::small_config(&dir);
    config.train.epochs = 10;
    config.train.max_steps = Some(3);

    let mut source = common::source(&config);
    let mut trainer = common::prepared_trainer(config);

    assert_eq!(trainer.train(source.as_mut()).unwrap(), 3);
    assert_eq!(trainer.phase(), Phase::Terminated);
    assert!(trainer.train(source.as_mut()).is_err());
}

#[test]
fn sampling_failures_do_not_stop_training() {
    let dir = common::temp_dir("sampling_failure");
    let metrics = dir.join("metrics.jsonl");

    let mut config = common::small_config(&dir);
    config.train.sample_interval = 1;
    config.train.max_steps = Some(2);
    config.logging.sink = SinkKind::Jsonl;
    config.logging.path = Some(metrics.clone());

    let mut source = common::source(&config);
    let mut trainer =
        Trainer::with_autoencoder(config, Arc::new(SingleProcess), Arc::new(BrokenDecoder)).unwrap();
    trainer.prepare().unwrap();

    let params = trainer.params().to_vec();
    let ema = trainer.ema_params().unwrap().to_vec();

    assert_eq!(trainer.train(source.as_mut()).unwrap(), 2);
    assert_eq!(trainer.steps(), 2);
    assert_ne!(trainer.params(), params.as_slice());
    assert_ne!(trainer.ema_params().unwrap(), ema.as_slice());

    let records: Vec<serde_json::Value> = fs::read_to_string(&metrics)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(records.len(), 2);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record["step"], i as u64);
        assert_eq!(record["skipped_step"], 0.0);
        assert!(record.get("samples").is_none(), "{record}");
    }
}

#[test]
fn disabled_scaler_leaves_loss_scale_out() {
    let dir = common::temp_dir("scaler_disabled_record");
    let mut config = common::small_config(&dir);
    config.train.target_batch_size = 0;
    config.train.scaler.enabled = false;

    let mut source = common::source(&config);
    let mut trainer = common::prepared_trainer(config);

    let record = trainer
        .micro_step(common::next(source.as_mut()))
        .unwrap()
        .unwrap();
    assert_eq!(record.get("loss_scale"), None);
    assert_eq!(record.get("skipped_step"), Some(&MetricValue::Scalar(0.0)));
}

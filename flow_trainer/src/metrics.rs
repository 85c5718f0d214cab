use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    time::{Duration, Instant},
};

use log::info;
use serde::Serialize;

use crate::{
    Result, TrainErr,
    collective::Collective,
    config::{LoggingConfig, SinkKind},
};

/// A single logged value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Media { shape: Vec<usize>, data: Vec<f32> },
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Scalar(v) => write!(f, "{v:.6}"),
            MetricValue::Media { shape, .. } => write!(f, "<media {shape:?}>"),
        }
    }
}

/// Everything logged for one completed update window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricRecord {
    pub step: u64,
    #[serde(flatten)]
    pub values: BTreeMap<String, MetricValue>,
}

impl MetricRecord {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            values: BTreeMap::new(),
        }
    }

    pub fn scalar(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), MetricValue::Scalar(value));
    }

    pub fn media(&mut self, name: &str, shape: Vec<usize>, data: Vec<f32>) {
        self.values.insert(name.to_string(), MetricValue::Media { shape, data });
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }
}

/// Receives the leader's records in step order.
pub trait MetricsSink: Send {
    fn emit(&mut self, record: &MetricRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes every record as a single `info` line.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    run_name: Option<String>,
}

impl LogSink {
    pub fn new(run_name: Option<String>) -> Self {
        Self { run_name }
    }
}

impl MetricsSink for LogSink {
    fn emit(&mut self, record: &MetricRecord) -> Result<()> {
        let values = record
            .values
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");

        let run = self.run_name.as_deref().unwrap_or("run");
        info!(run = run, step = record.step; "{values}");
        Ok(())
    }
}

/// Appends every record as a JSON object on its own line.
#[derive(Debug)]
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn emit(&mut self, record: &MetricRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }
}

/// Builds the sink a logging config names.
pub fn build_sink(config: &LoggingConfig) -> Result<Box<dyn MetricsSink>> {
    match config.sink {
        SinkKind::Log => Ok(Box::new(LogSink::new(config.run_name.clone()))),
        SinkKind::Jsonl => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| TrainErr::InvalidConfig("the jsonl sink needs a path".into()))?;

            Ok(Box::new(JsonlSink::create(path)?))
        }
    }
}

/// Rolling per-window means of named scalars.
#[derive(Debug, Clone, Default)]
pub struct LogHelper {
    sums: BTreeMap<String, (f64, usize)>,
}

impl LogHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, name: &str, value: f64) {
        let entry = self.sums.entry(name.to_string()).or_default();
        entry.0 += value;
        entry.1 += 1;
    }

    /// Returns the means since the last pop averaged across workers, and clears them.
    ///
    /// Every worker must have logged the same names.
    pub fn pop(&mut self, collective: &dyn Collective) -> Result<BTreeMap<String, f64>> {
        let sums = std::mem::take(&mut self.sums);
        let mut means: Vec<f32> = sums
            .values()
            .map(|(sum, count)| (*sum / (*count).max(1) as f64) as f32)
            .collect();

        collective.all_reduce_mean(&mut means)?;
        Ok(sums.into_keys().zip(means.into_iter().map(f64::from)).collect())
    }
}

/// Measures the time between consecutive laps.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    last: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self { last: Instant::now() }
    }

    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.last;
        self.last = now;
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::{SingleProcess, launch};

    #[test]
    fn helper_pops_means_and_clears() {
        let mut helper = LogHelper::new();
        helper.log("diffusion_loss", 1.0);
        helper.log("diffusion_loss", 3.0);
        helper.log("grad_norm", 0.5);

        let means = helper.pop(&SingleProcess).unwrap();
        assert_eq!(means["diffusion_loss"], 2.0);
        assert_eq!(means["grad_norm"], 0.5);
        assert!(helper.pop(&SingleProcess).unwrap().is_empty());
    }

    #[test]
    fn helper_averages_across_workers() {
        let means = launch(2, |member| {
            let mut helper = LogHelper::new();
            helper.log("loss", member.rank() as f64 * 2.);
            helper.pop(&member)
        })
        .unwrap();

        assert!(means.iter().all(|m| m["loss"] == 1.0));
    }

    #[test]
    fn jsonl_records_are_flat_objects() {
        let mut record = MetricRecord::new(3);
        record.scalar("lr", 0.5);
        record.media("samples", vec![1, 2], vec![0.0, 1.0]);

        let line = serde_json::to_string(&record).unwrap();
        assert_eq!(line, r#"{"step":3,"lr":0.5,"samples":{"shape":[1,2],"data":[0.0,1.0]}}"#);
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let path = std::env::temp_dir().join(format!("flow_trainer_metrics_{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut sink = JsonlSink::create(&path).unwrap();
        for step in 0..3 {
            let mut record = MetricRecord::new(step);
            record.scalar("diffusion_loss", 1.0);
            sink.emit(&record).unwrap();
        }
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }
}

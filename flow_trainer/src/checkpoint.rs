//! Durable training snapshots stored as a single safetensors file.
//!
//! Tensors are named `model.<param>`, `ema.<param>` and `opt.<state>`. The
//! header metadata carries the format tag, the version, the step counter and
//! the JSON encoded scalar state of the EMA, the optimizer, the scaler and
//! the scheduler.

use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
    fs, io,
    path::{Path, PathBuf},
};

use rectified_flow::ParamLayout;
use safetensors::{SafeTensorError, SafeTensors, tensor::TensorView};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{ema::EmaState, optimization::OptimizerState, scaler::ScalerState, tensors};

pub const FORMAT: &str = "rectified-flow-checkpoint";
pub const VERSION: &str = "1";

#[derive(Debug)]
pub enum CheckpointErr {
    Io(io::Error),
    SafeTensors(SafeTensorError),
    Json {
        key: &'static str,
        source: serde_json::Error,
    },
    MissingMetadata(&'static str),
    MissingTensor(String),
    LengthMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
    Incompatible(String),
}

impl Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io(e) => write!(f, "io error: {e}"),
            CheckpointErr::SafeTensors(e) => write!(f, "malformed safetensors file: {e}"),
            CheckpointErr::Json { key, source } => write!(f, "malformed `{key}` metadata: {source}"),
            CheckpointErr::MissingMetadata(key) => write!(f, "missing `{key}` metadata"),
            CheckpointErr::MissingTensor(name) => write!(f, "missing tensor `{name}`"),
            CheckpointErr::LengthMismatch {
                name,
                got,
                expected,
            } => write!(f, "tensor `{name}` has {got} values, expected {expected}"),
            CheckpointErr::Incompatible(msg) => write!(f, "incompatible checkpoint: {msg}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io(e) => Some(e),
            CheckpointErr::SafeTensors(e) => Some(e),
            CheckpointErr::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for CheckpointErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SafeTensorError> for CheckpointErr {
    fn from(value: SafeTensorError) -> Self {
        Self::SafeTensors(value)
    }
}

pub type Result<T> = std::result::Result<T, CheckpointErr>;

/// Everything needed to resume training with the same trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub steps: u64,
    pub model: Vec<f32>,
    pub ema: Vec<f32>,
    pub ema_state: EmaState,
    pub opt: OptimizerState,
    pub scaler: ScalerState,
    pub scheduler: Option<Value>,
}

/// The file a checkpoint taken after `steps` updates goes to.
pub fn path_for(dir: &Path, steps: u64) -> PathBuf {
    dir.join(format!("step_{steps}.safetensors"))
}

fn to_json<T: Serialize>(key: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| CheckpointErr::Json { key, source })
}

fn from_json<T: DeserializeOwned>(meta: &HashMap<String, String>, key: &'static str) -> Result<T> {
    let raw = meta.get(key).ok_or(CheckpointErr::MissingMetadata(key))?;
    serde_json::from_str(raw).map_err(|source| CheckpointErr::Json { key, source })
}

/// Writes `checkpoint` into `dir` through a temporary file renamed into place.
///
/// # Arguments
/// * `dir` - The checkpoint directory, created if missing.
/// * `checkpoint` - The snapshot.
/// * `layout` - The layout of the model and EMA buffers.
///
/// # Returns
/// The path of the written file.
pub fn save(dir: &Path, checkpoint: &Checkpoint, layout: &ParamLayout) -> Result<PathBuf> {
    for (name, len) in [("model", checkpoint.model.len()), ("ema", checkpoint.ema.len())] {
        if len != layout.len() {
            return Err(CheckpointErr::LengthMismatch {
                name: name.into(),
                got: len,
                expected: layout.len(),
            });
        }
    }

    let mut views = Vec::new();
    for spec in layout.specs() {
        let range = spec.range.clone();
        views.push((
            format!("model.{}", spec.name),
            tensors::f32_view(spec.shape.clone(), &checkpoint.model[range.clone()])?,
        ));
        views.push((
            format!("ema.{}", spec.name),
            tensors::f32_view(spec.shape.clone(), &checkpoint.ema[range])?,
        ));
    }

    for (name, values) in &checkpoint.opt.tensors {
        views.push((format!("opt.{name}"), tensors::f32_view(vec![values.len()], values)?));
    }

    let mut meta = HashMap::from([
        ("format".to_string(), FORMAT.to_string()),
        ("version".to_string(), VERSION.to_string()),
        ("steps".to_string(), checkpoint.steps.to_string()),
        ("ema".to_string(), to_json("ema", &checkpoint.ema_state)?),
        ("opt".to_string(), to_json("opt", &checkpoint.opt)?),
        ("scaler".to_string(), to_json("scaler", &checkpoint.scaler)?),
    ]);

    if let Some(scheduler) = &checkpoint.scheduler {
        meta.insert("scheduler".into(), to_json("scheduler", scheduler)?);
    }

    fs::create_dir_all(dir)?;
    let path = path_for(dir, checkpoint.steps);
    let tmp = dir.join(format!(".step_{}.safetensors.tmp", checkpoint.steps));

    safetensors::serialize_to_file(views, &Some(meta), &tmp)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

fn read_params(tensors: &SafeTensors<'_>, prefix: &str, layout: &ParamLayout) -> Result<Vec<f32>> {
    let mut params = vec![0.; layout.len()];

    for spec in layout.specs() {
        let name = format!("{prefix}.{}", spec.name);
        let view = tensors
            .tensor(&name)
            .map_err(|_| CheckpointErr::MissingTensor(name.clone()))?;

        let values = read_values(&name, &view)?;
        if values.len() != spec.len() {
            return Err(CheckpointErr::LengthMismatch {
                name,
                got: values.len(),
                expected: spec.len(),
            });
        }

        params[spec.range.clone()].copy_from_slice(&values);
    }

    Ok(params)
}

fn read_values(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    tensors::to_f32(view)
        .map(|(_, values)| values)
        .ok_or_else(|| CheckpointErr::Incompatible(format!("tensor `{name}` isn't a float tensor")))
}

/// Reads and validates a checkpoint without touching any live state.
///
/// # Arguments
/// * `path` - The checkpoint file.
/// * `layout` - The layout the model and EMA tensors must follow.
pub fn read(path: &Path, layout: &ParamLayout) -> Result<Checkpoint> {
    let bytes = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let meta = header
        .metadata()
        .clone()
        .ok_or(CheckpointErr::MissingMetadata("format"))?;

    match (meta.get("format"), meta.get("version")) {
        (Some(format), Some(version)) if format == FORMAT && version == VERSION => {}
        (Some(format), Some(version)) => {
            return Err(CheckpointErr::Incompatible(format!(
                "expected {FORMAT} v{VERSION}, got {format} v{version}"
            )));
        }
        (None, _) => return Err(CheckpointErr::MissingMetadata("format")),
        (_, None) => return Err(CheckpointErr::MissingMetadata("version")),
    }

    let steps = meta
        .get("steps")
        .ok_or(CheckpointErr::MissingMetadata("steps"))?
        .parse()
        .map_err(|_| CheckpointErr::Incompatible("`steps` isn't an integer".into()))?;

    let ema_state = from_json(&meta, "ema")?;
    let scaler = from_json(&meta, "scaler")?;
    let mut opt: OptimizerState = from_json(&meta, "opt")?;
    let scheduler = if meta.contains_key("scheduler") {
        Some(from_json(&meta, "scheduler")?)
    } else {
        None
    };

    let tensors = SafeTensors::deserialize(&bytes)?;
    let model = read_params(&tensors, "model", layout)?;
    let ema = read_params(&tensors, "ema", layout)?;

    for name in tensors.names() {
        if let Some(state) = name.strip_prefix("opt.") {
            let view = tensors.tensor(name)?;
            opt.tensors.insert(state.to_string(), read_values(name, &view)?);
        }
    }

    Ok(Checkpoint {
        steps,
        model,
        ema,
        ema_state,
        opt,
        scaler,
        scheduler,
    })
}

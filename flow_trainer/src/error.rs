use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use rand_distr::{NormalError, uniform::Error as UniformError};
use rectified_flow::MlErr;
use safetensors::SafeTensorError;

use crate::{checkpoint::CheckpointErr, collective::CollectiveErr, trainer::Phase};

/// The flow trainer's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
#[derive(Debug)]
pub enum TrainErr {
    Model(MlErr),
    Collective(CollectiveErr),
    Checkpoint(CheckpointErr),
    Io(io::Error),
    Json(serde_json::Error),
    SafeTensors(SafeTensorError),
    InvalidConfig(String),
    InvalidPhase {
        op: &'static str,
        phase: Phase,
    },
    Unknown {
        kind: &'static str,
        name: String,
    },
    InvalidKwargs {
        kind: &'static str,
        msg: String,
    },
    Autoencoder(String),
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

impl Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Model(e) => write!(f, "model error: {e}"),
            TrainErr::Collective(e) => write!(f, "collective error: {e}"),
            TrainErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Json(e) => write!(f, "json error: {e}"),
            TrainErr::SafeTensors(e) => write!(f, "safetensors error: {e}"),
            TrainErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            TrainErr::InvalidPhase { op, phase } => {
                write!(f, "can't run {op} while the trainer is {phase:?}")
            }
            TrainErr::Unknown { kind, name } => write!(f, "unknown {kind} `{name}`"),
            TrainErr::InvalidKwargs { kind, msg } => write!(f, "invalid {kind} arguments: {msg}"),
            TrainErr::Autoencoder(msg) => write!(f, "autoencoder error: {msg}"),
            TrainErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch in {what}: got {got}, expected {expected}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Model(e) => Some(e),
            TrainErr::Collective(e) => Some(e),
            TrainErr::Checkpoint(e) => Some(e),
            TrainErr::Io(e) => Some(e),
            TrainErr::Json(e) => Some(e),
            TrainErr::SafeTensors(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Model(value)
    }
}

impl From<CollectiveErr> for TrainErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<CheckpointErr> for TrainErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<SafeTensorError> for TrainErr {
    fn from(value: SafeTensorError) -> Self {
        Self::SafeTensors(value)
    }
}

impl From<ndarray::ShapeError> for TrainErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Model(MlErr::Shape(value))
    }
}

impl From<NormalError> for TrainErr {
    fn from(value: NormalError) -> Self {
        Self::Model(value.into())
    }
}

impl From<UniformError> for TrainErr {
    fn from(value: UniformError) -> Self {
        Self::Model(value.into())
    }
}

use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;
use rand_distr::{NormalError, uniform::Error as UniformError};

/// The result type used in the entire rectified flow crate.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The rectified flow crate's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    RankMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidConfig(String),
    BackwardBeforeForward {
        layer: &'static str,
    },
    EmptyBatch,
    Shape(ShapeError),
    Init(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::RankMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "The {what} has {got} dimensions but the configured input mode expects {expected}"
            ),
            MlErr::InvalidConfig(msg) => write!(f, "invalid model config: {msg}"),
            MlErr::BackwardBeforeForward { layer } => {
                write!(f, "Tried to run the backward pass of {layer} before its forward pass")
            }
            MlErr::EmptyBatch => f.write_str("The given batch has no elements"),
            MlErr::Shape(e) => write!(f, "shape error: {e}"),
            MlErr::Init(msg) => write!(f, "failed to initialize parameters: {msg}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<NormalError> for MlErr {
    fn from(value: NormalError) -> Self {
        Self::Init(value.to_string())
    }
}

impl From<UniformError> for MlErr {
    fn from(value: UniformError) -> Self {
        Self::Init(value.to_string())
    }
}

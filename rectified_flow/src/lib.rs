pub mod arch;
pub mod config;
pub mod error;
pub mod flow;
pub mod loss;
pub mod precision;

pub use arch::{DenoiserCore, ParamLayout};
pub use config::ModelConfig;
pub use error::{MlErr, Result};
pub use flow::{FlowModel, FlowSample, FlowTarget, InputMode};
pub use precision::Precision;

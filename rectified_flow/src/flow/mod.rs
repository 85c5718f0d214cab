mod model;
mod target;

pub use model::FlowModel;
pub use target::{FlowSample, FlowTarget, InputMode};

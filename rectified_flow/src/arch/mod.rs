pub mod activations;
pub mod blocks;
pub mod denoiser;
pub mod embeddings;
pub mod init;
pub mod layers;
pub mod layout;
pub mod proj;

pub use denoiser::DenoiserCore;
pub use init::Init;
pub use layout::{ParamLayout, ParamScope, ParamSpec};

mod attention;
mod linear;
mod mlp;
mod modulation;
mod norm;

pub use attention::{Attention, softmax_rows};
pub use linear::Linear;
pub use mlp::Mlp;
pub use modulation::{AdaLn, gate, gate_backward, modulate, modulate_backward};
pub use norm::LayerNorm;

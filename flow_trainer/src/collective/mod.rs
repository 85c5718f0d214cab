mod local;
mod single;

pub use local::{LocalGroup, LocalMember, launch};
pub use single::SingleProcess;

use std::{
    error::Error,
    fmt::{self, Display},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectiveErr {
    /// Another member failed and tore the group down.
    Aborted,
    SizeMismatch {
        got: usize,
        expected: usize,
    },
    InvalidRoot {
        root: usize,
        world_size: usize,
    },
}

impl Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Aborted => f.write_str("the worker group was aborted"),
            CollectiveErr::SizeMismatch { got, expected } => write!(
                f,
                "members contributed buffers of different sizes, got {got} and expected {expected}"
            ),
            CollectiveErr::InvalidRoot { root, world_size } => {
                write!(f, "rank {root} can't be the root of a group of {world_size}")
            }
        }
    }
}

impl Error for CollectiveErr {}

pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// The communication primitives shared by every worker of a run.
///
/// Every member must call the same operations in the same order, a member
/// that stops calling them stalls the others until the group is aborted.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Whether this member writes checkpoints and emits metrics.
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Replaces `buf` with the element-wise mean of every member's `buf`.
    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()>;

    /// Replaces `buf` with the `root` member's `buf`.
    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()>;

    /// Blocks until every member reaches the barrier.
    fn barrier(&self) -> Result<()>;

    /// Tears the group down, waking every blocked member with `Aborted`.
    fn abort(&self);
}

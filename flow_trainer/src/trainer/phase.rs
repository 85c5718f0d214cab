/// The lifecycle of a `Trainer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Built, nothing else ready yet.
    Uninitialized,
    /// Optimizer, scheduler and EMA built, parameters synchronized.
    Ready,
    Running,
    /// Writing a checkpoint between two update windows.
    Checkpointing,
    /// Training ended, no further steps are accepted.
    Terminated,
}

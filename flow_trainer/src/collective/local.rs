use std::{sync::Arc, thread};

use log::{debug, error};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{Collective, CollectiveErr, Result};
use crate::TrainErr;

#[derive(Debug, Default)]
struct State {
    arrived: usize,
    generation: u64,
    aborted: bool,
    buffer: Vec<f32>,
}

/// The shared half of an in-process worker group.
///
/// Members meet at an abortable generation barrier guarding a single shared
/// reduction buffer.
#[derive(Debug)]
pub struct LocalGroup {
    world_size: usize,
    state: Mutex<State>,
    cvar: Condvar,
}

impl LocalGroup {
    /// Creates a new `LocalGroup` of `world_size` members.
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size: world_size.max(1),
            state: Mutex::new(State::default()),
            cvar: Condvar::new(),
        })
    }

    /// Returns the handles of every member, ordered by rank.
    pub fn members(self: &Arc<Self>) -> Vec<LocalMember> {
        (0..self.world_size)
            .map(|rank| LocalMember {
                rank,
                group: Arc::clone(self),
            })
            .collect()
    }

    pub fn abort(&self) {
        let mut state = self.state.lock();
        if !state.aborted {
            state.aborted = true;
            self.cvar.notify_all();
        }
    }

    /// Waits for every member, the last one to arrive releases the others.
    ///
    /// # Returns
    /// `true` for the member that released the barrier.
    fn wait(&self, state: &mut MutexGuard<'_, State>) -> Result<bool> {
        if state.aborted {
            return Err(CollectiveErr::Aborted);
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(true);
        }

        while state.generation == generation && !state.aborted {
            self.cvar.wait(state);
        }

        if state.generation == generation {
            return Err(CollectiveErr::Aborted);
        }

        Ok(false)
    }

    /// Sizes the shared buffer for the first member to arrive, the others must match it.
    fn check_size(&self, state: &mut MutexGuard<'_, State>, len: usize) -> Result<()> {
        if state.arrived == 0 {
            state.buffer.clear();
            state.buffer.resize(len, 0.);
        } else if state.buffer.len() != len {
            let expected = state.buffer.len();
            state.aborted = true;
            self.cvar.notify_all();
            return Err(CollectiveErr::SizeMismatch { got: len, expected });
        }

        Ok(())
    }
}

/// A single member's handle to a `LocalGroup`.
#[derive(Debug, Clone)]
pub struct LocalMember {
    rank: usize,
    group: Arc<LocalGroup>,
}

impl Collective for LocalMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        let group = &self.group;
        let mut state = group.state.lock();

        if state.aborted {
            return Err(CollectiveErr::Aborted);
        }

        group.check_size(&mut state, buf.len())?;
        state.buffer.iter_mut().zip(buf.iter()).for_each(|(acc, v)| *acc += v);

        if state.arrived + 1 == group.world_size {
            let n = group.world_size as f32;
            state.buffer.iter_mut().for_each(|acc| *acc /= n);
        }

        group.wait(&mut state)?;
        buf.copy_from_slice(&state.buffer);
        group.wait(&mut state)?;
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()> {
        let group = &self.group;
        if root >= group.world_size {
            return Err(CollectiveErr::InvalidRoot {
                root,
                world_size: group.world_size,
            });
        }

        let mut state = group.state.lock();
        if state.aborted {
            return Err(CollectiveErr::Aborted);
        }

        group.check_size(&mut state, buf.len())?;
        if self.rank == root {
            state.buffer.copy_from_slice(buf);
        }

        group.wait(&mut state)?;
        if self.rank != root {
            buf.copy_from_slice(&state.buffer);
        }
        group.wait(&mut state)?;
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.group.state.lock();
        self.group.wait(&mut state)?;
        Ok(())
    }

    fn abort(&self) {
        self.group.abort();
    }
}

/// Aborts the group if its worker unwinds.
struct AbortOnPanic(Arc<LocalGroup>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// Runs `f` once per member of a new group, each on its own thread.
///
/// A member returning an error aborts the group so the others fail instead of
/// waiting on it forever.
///
/// # Returns
/// Every member's value ordered by rank, or the error that brought the
/// group down.
pub fn launch<T, F>(world_size: usize, f: F) -> crate::Result<Vec<T>>
where
    T: Send,
    F: Fn(LocalMember) -> crate::Result<T> + Sync,
{
    let group = LocalGroup::new(world_size);
    debug!(world_size = group.world_size; "launching local worker group");

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = group
            .members()
            .into_iter()
            .map(|member| {
                let f = &f;
                s.spawn(move || {
                    let rank = member.rank;
                    let _guard = AbortOnPanic(Arc::clone(&member.group));
                    let group = Arc::clone(&member.group);

                    let result = f(member);
                    if let Err(e) = &result {
                        error!(rank = rank; "worker failed: {e}");
                        group.abort();
                    }

                    result
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    });

    let mut values = Vec::with_capacity(results.len());
    let mut failure = None;

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => match failure {
                None => failure = Some(e),
                Some(TrainErr::Collective(CollectiveErr::Aborted)) => failure = Some(e),
                Some(_) => {}
            },
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

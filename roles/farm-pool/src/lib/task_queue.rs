//! In-process delayed task queue.
//!
//! Every task is keyed by what it does. Scheduling a key that is still waiting
//! replaces the waiting task, so bursts of the same trigger collapse into one
//! run at the latest due time. A task that already started is never aborted by
//! a reschedule.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::Instrument;

use crate::types::{BlockIndex, ExitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Harvest scan triggered by a newly discovered block.
    HarvestScanBlock(BlockIndex),
    /// Harvest scan triggered by completed work on a block.
    HarvestScanWork(BlockIndex),
    ExitRetry(ExitId),
}

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

type PendingMap = HashMap<TaskKey, Pending>;

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn lock(tasks: &StdMutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct TaskQueue {
    tasks: Arc<StdMutex<PendingMap>>,
    next_generation: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub fn schedule_in<F>(&self, key: TaskKey, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let due = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        self.schedule_at(key, due, fut)
    }

    /// Runs `fut` at `due`, replacing a task with the same key that has not
    /// started yet.
    #[track_caller]
    pub fn schedule_at<F>(&self, key: TaskKey, due: Instant, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let location = std::panic::Location::caller();
        let span = tracing::trace_span!(
            "scheduled_task",
            ?key,
            file = location.file(),
            line = location.line(),
        );
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();

        // Held across the spawn so the task cannot observe the map before its
        // own entry is in place.
        let mut pending = lock(&self.tasks);
        let handle = tokio::spawn(
            async move {
                tokio::time::sleep_until(due).await;
                {
                    let mut pending = lock(&tasks);
                    if pending.get(&key).map(|p| p.generation) == Some(generation) {
                        pending.remove(&key);
                    }
                }
                fut.await;
            }
            .instrument(span),
        );
        let replaced = pending.insert(
            key,
            Pending { generation, handle },
        );
        if let Some(previous) = replaced {
            tracing::trace!(?key, "Replacing pending task");
            previous.handle.abort();
        }
    }

    /// Drops a task that has not started yet.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        match lock(&self.tasks).remove(key) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &TaskKey) -> bool {
        lock(&self.tasks).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn abort_all(&self) {
        for (_, pending) in lock(&self.tasks).drain() {
            pending.handle.abort();
        }
    }
}

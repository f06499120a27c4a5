use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use gamewarden_process::IdleShutdownStatus;
use tokio::{task::JoinHandle, time::Instant};

#[derive(Debug)]
struct Armed {
    generation: u64,
    reason: String,
    deadline: Instant,
    task: JoinHandle<()>,
}

/// A replaceable "do this after N seconds unless cancelled" slot.
///
/// Expiry and cancellation race on one atomic generation counter: the sleeping
/// task only runs its action if it can still claim the generation it was armed
/// with, and `cancel` invalidates that generation.
#[derive(Debug, Default)]
pub struct IdleTimer {
    generation: Arc<AtomicU64>,
    armed: Option<Armed>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any armed timer.
    ///
    /// `on_expire` runs on its own task, so it may cancel or re-arm this timer.
    pub fn arm<F, Fut>(&mut self, after: Duration, reason: impl Into<String>, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = self.generation.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if shared
                .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tokio::spawn(on_expire());
            }
        });

        self.armed = Some(Armed {
            generation,
            reason: reason.into(),
            deadline: Instant::now() + after,
            task,
        });
    }

    /// Returns whether a pending timer was cancelled. Safe to call at any time.
    pub fn cancel(&mut self) -> bool {
        let Some(armed) = self.armed.take() else {
            return false;
        };
        let pending = self
            .generation
            .compare_exchange(
                armed.generation,
                armed.generation + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        armed.task.abort();
        pending
    }

    /// Armed and not yet fired.
    pub fn is_armed(&self) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|a| self.generation.load(Ordering::Acquire) == a.generation)
    }

    pub fn status(&self) -> Option<IdleShutdownStatus> {
        let armed = self.armed.as_ref().filter(|_| self.is_armed())?;
        let remaining = armed.deadline.saturating_duration_since(Instant::now());
        Some(IdleShutdownStatus {
            reason: armed.reason.clone(),
            remaining_secs: remaining.as_secs(),
        })
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

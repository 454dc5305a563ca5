// progress.rs -- progress of long document operations, polled from another thread
//
// Operations run synchronously on the caller's thread. A UI thread holding a
// clone of the `Arc<Progress>` reads the current stage and counters while the
// work runs. There is no cancellation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared progress state for one document.
#[derive(Debug, Default)]
pub struct Progress {
    stage: Mutex<String>,
    done: AtomicUsize,
    total: AtomicUsize,
    active: AtomicBool,
}

/// Point-in-time copy of a `Progress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub stage: String,
    pub done: usize,
    pub total: usize,
    pub active: bool,
}

impl ProgressSnapshot {
    /// Completion in [0, 1]; 0 when the stage has no known total.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.done.min(self.total) as f32) / self.total as f32
        }
    }
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Begin a stage of `total` steps.
    pub fn start(&self, stage: &str, total: usize) {
        {
            let mut s = self.stage.lock();
            s.clear();
            s.push_str(stage);
        }
        self.done.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
        tracing::debug!(stage, total, "progress stage");
    }

    #[inline]
    pub fn tick(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn advance(&self, n: usize) {
        self.done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.done.store(self.total.load(Ordering::Relaxed), Ordering::Relaxed);
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: self.stage.lock().clone(),
            done: self.done.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            active: self.is_active(),
        }
    }
}

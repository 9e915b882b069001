use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking transaction and redo activity.
///
/// Implementations receive one call per finished transaction and per redo
/// frame, so they must be cheap and thread-safe.
pub trait EngineMetrics: Send + Sync {
    /// A transaction committed after applying `records` undo records.
    fn transaction_committed(&self, records: usize);

    /// A transaction rolled back `records` undo records.
    fn transaction_rolled_back(&self, records: usize);

    /// A redo frame of `bytes` payload bytes was appended.
    fn redo_appended(&self, bytes: usize);

    /// An undo record targeted a map that no longer exists.
    fn record_skipped(&self);
}

/// A no-op implementation of [`EngineMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl EngineMetrics for NoopMetrics {
    fn transaction_committed(&self, _records: usize) {}
    fn transaction_rolled_back(&self, _records: usize) {}
    fn redo_appended(&self, _bytes: usize) {}
    fn record_skipped(&self) {}
}

/// A thread-safe counter-based implementation of [`EngineMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of committed transactions.
    pub commits: AtomicU64,

    /// Number of rolled back transactions.
    pub rollbacks: AtomicU64,

    /// Undo records applied by commits.
    pub records_applied: AtomicU64,

    /// Undo records reverted by rollbacks.
    pub records_reverted: AtomicU64,

    /// Redo frames appended.
    pub redo_frames: AtomicU64,

    /// Redo payload bytes appended.
    pub redo_bytes: AtomicU64,

    /// Records skipped because their map was dropped.
    pub records_skipped: AtomicU64,
}

impl EngineMetrics for CounterMetrics {
    fn transaction_committed(&self, records: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.records_applied
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    fn transaction_rolled_back(&self, records: usize) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.records_reverted
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    fn redo_appended(&self, bytes: usize) {
        self.redo_frames.fetch_add(1, Ordering::Relaxed);
        self.redo_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, which discards everything.
pub fn default_metrics() -> Arc<dyn EngineMetrics> {
    Arc::new(NoopMetrics)
}

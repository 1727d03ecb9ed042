use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters shared by the generator and the publisher.
#[derive(Debug, Default)]
pub struct PipelineStats {
    generated: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub generated: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub connects: u64,
    pub disconnects: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_generated(&self, accepted: bool) {
        self.generated.fetch_add(1, Ordering::Relaxed);
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            generated: self.generated.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Accepted items not yet accounted for as published or failed.
    pub fn in_queue(&self) -> u64 {
        self.accepted
            .saturating_sub(self.published)
            .saturating_sub(self.publish_failures)
    }
}

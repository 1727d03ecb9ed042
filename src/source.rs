//! Periodic measurement generator.
//!
//! Produces one [`Measurement`] per tick and offers it to the queue without
//! blocking. A full queue drops the new measurement; the generator never
//! retries or slows down, so it stays decoupled from the publisher's health.

use crate::clock::Clock;
use crate::measurement::Measurement;
use crate::queue::{EnqueueError, QueueWriter};
use crate::stats::PipelineStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub ticks: u64,
    pub accepted: u64,
    pub dropped: u64,
}

pub struct MeasurementSource {
    period: Duration,
    clock: Arc<dyn Clock>,
    writer: QueueWriter<Measurement>,
    stats: Arc<PipelineStats>,
}

impl MeasurementSource {
    pub fn new(period: Duration, clock: Arc<dyn Clock>, writer: QueueWriter<Measurement>) -> Self {
        Self {
            period,
            clock,
            writer,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Tick until `cancel` fires, then close the queue for writes.
    pub async fn run(self, cancel: CancellationToken) -> SourceSummary {
        let period = self.period.max(Duration::from_millis(1));
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut summary = SourceSummary::default();

        info!(period_ms = period.as_millis(), "Measurement source started");

        loop {
            let fired_at = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                fired_at = timer.tick() => fired_at,
            };

            summary.ticks += 1;
            let measurement = Measurement::at(self.clock.timestamp_at(fired_at));
            debug!(measurement = measurement.message(), "Created measurement");

            match self.writer.try_enqueue(measurement) {
                Ok(()) => {
                    summary.accepted += 1;
                    self.stats.record_generated(true);
                }
                Err(EnqueueError::Full(dropped)) => {
                    summary.dropped += 1;
                    self.stats.record_generated(false);
                    warn!(
                        measurement = dropped.message(),
                        capacity = self.writer.capacity(),
                        "Queue full, measurement dropped"
                    );
                }
                Err(EnqueueError::Closed(dropped)) => {
                    summary.dropped += 1;
                    self.stats.record_generated(false);
                    warn!(
                        measurement = dropped.message(),
                        "Queue closed, measurement dropped"
                    );
                }
            }
        }

        self.writer.close();
        info!(
            ticks = summary.ticks,
            accepted = summary.accepted,
            dropped = summary.dropped,
            "Measurement source stopped"
        );
        summary
    }
}

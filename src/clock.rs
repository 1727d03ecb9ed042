//! Wall-clock timestamps for timer ticks.

use chrono::{DateTime, FixedOffset, Utc};
use tokio::time::Instant;

/// Maps a timer's logical firing instant to an offset-aware timestamp.
pub trait Clock: Send + Sync {
    fn timestamp_at(&self, instant: Instant) -> DateTime<FixedOffset>;
}

/// A clock anchored to one wall-clock reading taken together with one
/// monotonic instant; later instants are projected forward from the anchor.
///
/// Because it follows `tokio::time::Instant`, a paused runtime turns it into a
/// fully virtual clock.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl AnchoredClock {
    pub fn new(wall: DateTime<Utc>, mono: Instant) -> Self {
        Self { wall, mono }
    }

    pub fn system() -> Self {
        Self::new(Utc::now(), Instant::now())
    }
}

impl Clock for AnchoredClock {
    fn timestamp_at(&self, instant: Instant) -> DateTime<FixedOffset> {
        let elapsed = instant.saturating_duration_since(self.mono);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        self.wall
            .checked_add_signed(elapsed)
            .unwrap_or(self.wall)
            .fixed_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn projects_elapsed_monotonic_time_onto_anchor() {
        let wall = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = AnchoredClock::new(wall, Instant::now());

        tokio::time::advance(Duration::from_millis(1500)).await;

        let stamp = clock.timestamp_at(Instant::now());
        assert_eq!(stamp, (wall + chrono::Duration::milliseconds(1500)).fixed_offset());
        assert_eq!(stamp.offset().local_minus_utc(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn instants_before_anchor_clamp_to_anchor() {
        let before = Instant::now();
        tokio::time::advance(Duration::from_secs(5)).await;
        let wall = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = AnchoredClock::new(wall, Instant::now());

        assert_eq!(clock.timestamp_at(before), wall.fixed_offset());
    }
}

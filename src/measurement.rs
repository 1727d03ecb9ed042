//! The atomic unit of telemetry flowing through the pipeline.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ticks (100 ns intervals) between `0001-01-01T00:00:00Z` and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;

/// An immutable timestamped reading.
///
/// Serialized as `{"TimeStamp": "<RFC 3339>", "Message": "<text>"}`, the shape
/// the downstream ingestion and table writers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "TimeStamp", alias = "timestamp")]
    timestamp: DateTime<FixedOffset>,
    #[serde(rename = "Message", alias = "message")]
    message: String,
}

impl Measurement {
    pub fn new(timestamp: DateTime<FixedOffset>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    /// Measurement whose message is the tick count of `timestamp`.
    pub fn at(timestamp: DateTime<FixedOffset>) -> Self {
        let message = ticks(&timestamp).to_string();
        Self { timestamp, message }
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Encode as the JSON wire payload published to the broker.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("invalid measurement payload")
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Measurement {{ TimeStamp = {}, Message = {} }}",
            self.timestamp.to_rfc3339(),
            self.message
        )
    }
}

/// Number of 100 ns ticks since `0001-01-01T00:00:00Z`.
pub fn ticks<Tz: chrono::TimeZone>(timestamp: &DateTime<Tz>) -> i64 {
    let seconds = timestamp.timestamp();
    let sub_ticks = i64::from(timestamp.timestamp_subsec_nanos()) / NANOS_PER_TICK;
    UNIX_EPOCH_TICKS + seconds * TICKS_PER_SECOND + sub_ticks
}

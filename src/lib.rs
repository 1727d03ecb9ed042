#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Telemetry unit: a periodic measurement generator feeding a bounded
//! single-producer/single-consumer queue, drained by a TLS-authenticated
//! MQTT publisher.
//!
//! ```text
//! MeasurementSource ──try_enqueue──▶ BoundedQueue ──dequeue──▶ BrokerPublisher ──▶ broker
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod measurement;
pub mod publisher;
pub mod queue;
pub mod source;
pub mod stats;

pub use config::Config;
pub use measurement::Measurement;

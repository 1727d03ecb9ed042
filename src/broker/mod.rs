//! Broker-facing side of the pipeline.
//!
//! [`BrokerSession`] is the seam between the publisher's drain loop and a
//! concrete transport: [`mqtt::MqttSession`] for real brokers and
//! [`loopback::LoopbackSession`] for dry runs and tests.

pub mod connection;
pub mod loopback;
pub mod mqtt;
pub mod tls;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use connection::{
    ConnectionLifecycle, ConnectionState, DisconnectReason, LifecycleHook, LoggingHook,
};

/// Delivery guarantee requested for each publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityOfService {
    /// Done once the packet is written to the socket.
    AtMostOnce,
    /// Done once the broker acknowledges with `PUBACK`.
    #[default]
    AtLeastOnce,
}

impl QualityOfService {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection to broker failed: {0}")]
    Connect(String),
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not connected to broker")]
    NotConnected,
}

/// Something the session observed while idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Keep-alive or other traffic that needs no action.
    Idle,
    /// The connection is gone.
    Disconnected(DisconnectReason),
}

/// One long-lived connection to a message broker.
///
/// Calls are strictly serial: the publisher never has more than one
/// operation outstanding on a session.
#[async_trait]
pub trait BrokerSession: Send {
    fn client_id(&self) -> &str;

    /// Open the connection and wait for the broker to accept it.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Publish one payload and wait until it is acknowledged at `qos`.
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), BrokerError>;

    /// Drive background traffic until something noteworthy happens.
    /// Must be cancel-safe; only polled while connected.
    async fn next_event(&mut self) -> SessionEvent;

    /// Disconnect with the normal-disconnection reason code.
    async fn disconnect(&mut self) -> Result<(), BrokerError>;
}

//! In-process broker for dry runs and tests.
//!
//! [`LoopbackBroker`] is a cloneable control handle; [`LoopbackSession`] is
//! the [`BrokerSession`] the publisher drives. The handle can inject connect
//! and publish failures, sever the connection, and slow down acknowledgements.

use super::{BrokerError, BrokerSession, DisconnectReason, QualityOfService, SessionEvent};
use crate::measurement::Measurement;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QualityOfService,
}

impl PublishedMessage {
    pub fn measurement(&self) -> anyhow::Result<Measurement> {
        Measurement::from_payload(&self.payload)
    }
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    connected: bool,
    fail_connects: usize,
    fail_publishes: usize,
    pending_drop: Option<DisconnectReason>,
    published: Vec<PublishedMessage>,
    connect_attempts: u64,
    in_flight: usize,
    max_in_flight: usize,
    ack_delay: Duration,
    log_publishes: bool,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connected: false,
            fail_connects: 0,
            fail_publishes: 0,
            pending_drop: None,
            published: Vec::new(),
            connect_attempts: 0,
            in_flight: 0,
            max_in_flight: 0,
            ack_delay: Duration::ZERO,
            log_publishes: false,
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    published: Notify,
    dropped: Notify,
}

#[derive(Clone, Default)]
pub struct LoopbackBroker {
    shared: Arc<Shared>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that logs every accepted publish at `info`.
    pub fn dry_run() -> Self {
        let broker = Self::new();
        broker.shared.state.lock().log_publishes = true;
        broker
    }

    pub fn session(&self, client_id: impl Into<String>) -> LoopbackSession {
        LoopbackSession {
            client_id: client_id.into(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state.lock().reachable = reachable;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.shared.state.lock().fail_connects = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state.lock().fail_publishes = count;
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        self.shared.state.lock().ack_delay = delay;
    }

    /// Sever the current connection; the session reports `reason` from its
    /// next `next_event` call. No-op while disconnected.
    pub fn drop_connection(&self, reason: DisconnectReason) {
        let mut state = self.shared.state.lock();
        if state.connected {
            state.connected = false;
            state.pending_drop = Some(reason);
            drop(state);
            self.shared.dropped.notify_one();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.shared.state.lock().published.len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.state.lock().connect_attempts
    }

    /// Highest number of publishes that were awaiting acknowledgement at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.state.lock().max_in_flight
    }

    pub async fn wait_for_published(&self, count: usize) {
        loop {
            let notified = self.shared.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.published_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

pub struct LoopbackSession {
    client_id: String,
    shared: Arc<Shared>,
}

struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn begin(shared: &'a Shared) -> Self {
        let mut state = shared.state.lock();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().in_flight -= 1;
    }
}

#[async_trait]
impl BrokerSession for LoopbackSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(BrokerError::Connect("broker unreachable".into()));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::Connect("connection refused".into()));
        }
        state.connected = true;
        state.pending_drop = None;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), BrokerError> {
        let ack_delay = {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(BrokerError::NotConnected);
            }
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                state.connected = false;
                return Err(BrokerError::Publish("connection reset by peer".into()));
            }
            state.ack_delay
        };

        let _in_flight = InFlight::begin(&self.shared);
        if !ack_delay.is_zero() {
            tokio::time::sleep(ack_delay).await;
        }

        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(BrokerError::Publish("connection lost before acknowledgement".into()));
        }
        if state.log_publishes {
            info!(
                topic,
                payload = %String::from_utf8_lossy(&payload),
                "Dry run publish"
            );
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        drop(state);
        self.shared.published.notify_waiters();
        Ok(())
    }

    async fn next_event(&mut self) -> SessionEvent {
        loop {
            let notified = self.shared.dropped.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(reason) = state.pending_drop.take() {
                    return SessionEvent::Disconnected(reason);
                }
                if !state.connected {
                    return SessionEvent::Disconnected(DisconnectReason::Transport(
                        "no active connection".into(),
                    ));
                }
            }
            notified.await;
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        state.connected = false;
        state.pending_drop = None;
        Ok(())
    }
}

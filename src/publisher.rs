//! Queue-draining broker publisher.
//!
//! Owns the broker session exclusively. Items leave the queue only while the
//! connection is up and are published one at a time, each awaiting its
//! acknowledgement before the next is taken. While disconnected, items stay
//! queued and go out in order once the connection is back.

use crate::broker::{
    BrokerError, BrokerSession, ConnectionLifecycle, ConnectionState, DisconnectReason,
    LifecycleHook, QualityOfService, SessionEvent,
};
use crate::config::{MqttConfig, ReliabilityConfig};
use crate::measurement::Measurement;
use crate::queue::{QueueReader, Readiness};
use crate::stats::PipelineStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSettings {
    pub topic: String,
    pub qos: QualityOfService,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    /// Bound on the graceful disconnect at shutdown. Kept below the
    /// host's shutdown timeout so the task is never aborted mid-disconnect.
    pub disconnect_timeout: Duration,
    /// When `false`, a lost connection is never re-established.
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            topic: "/measurements".into(),
            qos: QualityOfService::AtLeastOnce,
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            reconnect: true,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl PublisherSettings {
    pub fn from_config(mqtt: &MqttConfig, reliability: &ReliabilityConfig) -> Self {
        let initial_backoff = Duration::from_secs(reliability.reconnect_initial_backoff_secs.max(1));
        Self {
            topic: mqtt.topic.clone(),
            qos: QualityOfService::from_level(mqtt.qos).unwrap_or_default(),
            connect_timeout: Duration::from_secs(mqtt.connect_timeout_secs),
            publish_timeout: Duration::from_secs(mqtt.publish_timeout_secs),
            disconnect_timeout: Duration::from_secs(mqtt.connect_timeout_secs)
                .min(Duration::from_secs(reliability.shutdown_timeout_secs) / 2),
            reconnect: reliability.reconnect,
            initial_backoff,
            max_backoff: Duration::from_secs(reliability.reconnect_max_backoff_secs)
                .max(initial_backoff),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherSummary {
    pub published: u64,
    pub failed: u64,
    pub connects: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("connection to broker failed: {0}")]
    Connect(#[source] BrokerError),
    #[error("connection to broker timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("publish failed: {0}")]
    Publish(#[source] BrokerError),
    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),
}

enum ConnectOutcome {
    Connected,
    Cancelled,
    Failed(PublisherError),
}

enum Wake {
    Cancelled,
    Session(SessionEvent),
    Queue(Readiness),
}

pub struct BrokerPublisher<S> {
    session: S,
    reader: QueueReader<Measurement>,
    settings: PublisherSettings,
    lifecycle: ConnectionLifecycle,
    stats: Arc<PipelineStats>,
    summary: PublisherSummary,
    /// Set once the connection is lost with reconnection disabled.
    halted: bool,
}

impl<S: BrokerSession> BrokerPublisher<S> {
    pub fn new(session: S, reader: QueueReader<Measurement>, settings: PublisherSettings) -> Self {
        Self {
            session,
            reader,
            settings,
            lifecycle: ConnectionLifecycle::new(),
            stats: Arc::new(PipelineStats::new()),
            summary: PublisherSummary::default(),
            halted: false,
        }
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn register_hook(&mut self, hook: impl LifecycleHook + 'static) {
        self.lifecycle.register(hook);
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }

    /// Connect, drain until cancelled or the queue is closed and empty, then
    /// disconnect gracefully. Cancellation is a clean exit, not an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PublisherSummary, PublisherError> {
        info!(
            topic = %self.settings.topic,
            qos = self.settings.qos.level(),
            reconnect = self.settings.reconnect,
            "Broker publisher started"
        );
        let outcome = self.drive(&cancel).await;
        self.shutdown().await;
        outcome.map(|()| self.summary)
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), PublisherError> {
        let mut backoff = self.settings.initial_backoff;

        loop {
            if !self.lifecycle.is_connected() {
                if self.halted {
                    cancel.cancelled().await;
                    return Ok(());
                }
                match self.connect_once(cancel).await {
                    ConnectOutcome::Connected => backoff = self.settings.initial_backoff,
                    ConnectOutcome::Cancelled => return Ok(()),
                    ConnectOutcome::Failed(err) => {
                        if !self.settings.reconnect {
                            return Err(err);
                        }
                        warn!(error = %err, retry_in = ?backoff, "Broker connection failed, retrying");
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Ok(()),
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = backoff.saturating_mul(2).min(self.settings.max_backoff);
                        continue;
                    }
                }
            }

            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => Wake::Cancelled,
                event = self.session.next_event() => Wake::Session(event),
                readiness = self.reader.wait_readable(cancel) => Wake::Queue(readiness),
            };

            match wake {
                Wake::Cancelled | Wake::Queue(Readiness::Cancelled) => return Ok(()),
                Wake::Session(SessionEvent::Idle) => {}
                Wake::Session(SessionEvent::Disconnected(reason)) => self.connection_lost(&reason),
                Wake::Queue(Readiness::Closed) => {
                    info!("Queue closed and drained");
                    return Ok(());
                }
                Wake::Queue(Readiness::Ready) => self.drain(cancel).await?,
            }
        }
    }

    async fn connect_once(&mut self, cancel: &CancellationToken) -> ConnectOutcome {
        self.lifecycle.connecting(self.session.client_id());

        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = timeout(self.settings.connect_timeout, self.session.connect()) => Some(result),
        };

        match attempt {
            None => {
                self.lifecycle.disconnected(&DisconnectReason::Normal);
                ConnectOutcome::Cancelled
            }
            Some(Ok(Ok(()))) => {
                self.lifecycle.connected();
                self.stats.record_connect();
                self.summary.connects += 1;
                ConnectOutcome::Connected
            }
            Some(Ok(Err(e))) => {
                self.lifecycle
                    .disconnected(&DisconnectReason::ConnectFailed(e.to_string()));
                ConnectOutcome::Failed(PublisherError::Connect(e))
            }
            Some(Err(_)) => {
                self.lifecycle.disconnected(&DisconnectReason::ConnectTimeout);
                ConnectOutcome::Failed(PublisherError::ConnectTimeout(self.settings.connect_timeout))
            }
        }
    }

    async fn drain(&mut self, cancel: &CancellationToken) -> Result<(), PublisherError> {
        while self.lifecycle.is_connected() && !cancel.is_cancelled() {
            let Some(measurement) = self.reader.try_dequeue() else {
                break;
            };
            self.publish_one(&measurement, cancel).await?;
        }
        Ok(())
    }

    async fn publish_one(
        &mut self,
        measurement: &Measurement,
        cancel: &CancellationToken,
    ) -> Result<(), PublisherError> {
        let payload = match measurement.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.summary.failed += 1;
                self.stats.record_publish_failure();
                error!(measurement = measurement.message(), error = %e, "Failed to encode measurement, dropped");
                return Ok(());
            }
        };

        let publish_timeout = self.settings.publish_timeout;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = timeout(
                publish_timeout,
                self.session
                    .publish(&self.settings.topic, payload, self.settings.qos),
            ) => Some(result),
        };

        let Some(result) = result else {
            self.summary.failed += 1;
            self.stats.record_publish_failure();
            warn!(
                measurement = measurement.message(),
                "Shutdown interrupted publish, measurement dropped"
            );
            return Ok(());
        };

        let (reason, err) = match result {
            Ok(Ok(())) => {
                self.summary.published += 1;
                self.stats.record_published();
                debug!(measurement = measurement.message(), "Published measurement");
                return Ok(());
            }
            Ok(Err(e)) => (
                DisconnectReason::PublishFailed(e.to_string()),
                PublisherError::Publish(e),
            ),
            Err(_) => (
                DisconnectReason::PublishTimeout,
                PublisherError::PublishTimeout(publish_timeout),
            ),
        };

        self.summary.failed += 1;
        self.stats.record_publish_failure();
        error!(
            measurement = measurement.message(),
            %reason,
            "Publish failed, measurement dropped"
        );
        self.connection_lost(&reason);
        if self.settings.reconnect {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn connection_lost(&mut self, reason: &DisconnectReason) {
        if self.lifecycle.disconnected(reason) {
            self.stats.record_disconnect();
        }
        if !self.settings.reconnect {
            self.halted = true;
            warn!("Reconnection disabled; publisher stops draining until shutdown");
        }
    }

    async fn shutdown(&mut self) {
        if self.lifecycle.is_connected() {
            match timeout(self.settings.disconnect_timeout, self.session.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Graceful disconnect failed"),
                Err(_) => warn!("Graceful disconnect timed out"),
            }
            if self.lifecycle.disconnected(&DisconnectReason::Normal) {
                self.stats.record_disconnect();
            }
        }
        self.lifecycle.clear_hooks();
        info!(
            published = self.summary.published,
            failed = self.summary.failed,
            connects = self.summary.connects,
            queued = self.reader.len(),
            "Broker publisher stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::LoopbackBroker;
    use crate::queue::{self, QueueWriter};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl LifecycleHook for Recorder {
        fn on_connecting(&self, client_id: &str) {
            self.0.lock().push(format!("connecting:{client_id}"));
        }
        fn on_connected(&self) {
            self.0.lock().push("connected".into());
        }
        fn on_disconnected(&self, reason: &DisconnectReason) {
            self.0.lock().push(format!("disconnected:{reason}"));
        }
    }

    fn measurement(second: u32) -> Measurement {
        Measurement::at(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, second)
                .unwrap()
                .fixed_offset(),
        )
    }

    fn filled(items: u32) -> (QueueWriter<Measurement>, QueueReader<Measurement>) {
        let (writer, reader) = queue::bounded(queue::DEFAULT_CAPACITY);
        for n in 1..=items {
            assert!(writer.enqueue(measurement(n)));
        }
        (writer, reader)
    }

    fn settings(reconnect: bool) -> PublisherSettings {
        PublisherSettings {
            reconnect,
            ..PublisherSettings::default()
        }
    }

    fn published_seconds(broker: &LoopbackBroker) -> Vec<u32> {
        use chrono::Timelike;
        broker
            .published()
            .iter()
            .map(|m| m.measurement().unwrap().timestamp().second())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_queued_items_in_order_one_at_a_time() {
        let broker = LoopbackBroker::new();
        broker.set_ack_delay(Duration::from_millis(50));
        let (writer, reader) = filled(3);
        writer.close();

        let publisher = BrokerPublisher::new(broker.session("unit-1"), reader, settings(true));
        let state = publisher.state_receiver();
        let summary = publisher.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.published, 3);
        assert_eq!(summary.connects, 1);
        assert_eq!(published_seconds(&broker), vec![1, 2, 3]);
        assert_eq!(broker.max_in_flight(), 1);
        assert!(broker.published().iter().all(|m| m.topic == "/measurements"));
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert!(!broker.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_then_flush_backlog() {
        let broker = LoopbackBroker::new();
        broker.fail_next_connects(2);
        let (writer, reader) = filled(3);
        writer.close();
        let stats = Arc::new(PipelineStats::new());

        let started = tokio::time::Instant::now();
        let summary = BrokerPublisher::new(broker.session("unit-1"), reader, settings(true))
            .with_stats(Arc::clone(&stats))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(summary.published, 3);
        assert_eq!(published_seconds(&broker), vec![1, 2, 3]);
        // 1s then 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(stats.snapshot().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let broker = LoopbackBroker::new();
        broker.fail_next_connects(4);
        let (writer, reader) = filled(1);
        writer.close();
        let settings = PublisherSettings {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
            ..PublisherSettings::default()
        };

        let started = tokio::time::Instant::now();
        BrokerPublisher::new(broker.session("unit-1"), reader, settings)
            .run(CancellationToken::new())
            .await
            .unwrap();

        // 1 + 2 + 2 + 2
        assert_eq!(started.elapsed().as_secs(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failure_is_fatal_without_reconnect() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let (_writer, reader) = filled(1);

        let err = BrokerPublisher::new(broker.session("unit-1"), reader, settings(false))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublisherError::Connect(BrokerError::Connect(_))));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_enforced() {
        struct Hanging;

        #[async_trait::async_trait]
        impl BrokerSession for Hanging {
            fn client_id(&self) -> &str {
                "hanging"
            }
            async fn connect(&mut self) -> Result<(), BrokerError> {
                std::future::pending().await
            }
            async fn publish(
                &mut self,
                _topic: &str,
                _payload: Vec<u8>,
                _qos: QualityOfService,
            ) -> Result<(), BrokerError> {
                Err(BrokerError::NotConnected)
            }
            async fn next_event(&mut self) -> SessionEvent {
                std::future::pending().await
            }
            async fn disconnect(&mut self) -> Result<(), BrokerError> {
                Ok(())
            }
        }

        let (_writer, reader) = queue::bounded::<Measurement>(4);
        let settings = PublisherSettings {
            reconnect: false,
            connect_timeout: Duration::from_secs(3),
            ..PublisherSettings::default()
        };
        let err = BrokerPublisher::new(Hanging, reader, settings)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublisherError::ConnectTimeout(d) if d == Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_drops_item_and_reconnects() {
        let broker = LoopbackBroker::new();
        broker.fail_next_publishes(1);
        let (writer, reader) = filled(3);
        writer.close();
        let stats = Arc::new(PipelineStats::new());

        let summary = BrokerPublisher::new(broker.session("unit-1"), reader, settings(true))
            .with_stats(Arc::clone(&stats))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.connects, 2);
        assert_eq!(published_seconds(&broker), vec![2, 3]);
        let snap = stats.snapshot();
        assert_eq!(snap.publish_failures, 1);
        assert_eq!(snap.disconnects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_is_fatal_without_reconnect() {
        let broker = LoopbackBroker::new();
        broker.fail_next_publishes(1);
        let (_writer, reader) = filled(2);

        let err = BrokerPublisher::new(broker.session("unit-1"), reader, settings(false))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublisherError::Publish(_)));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_timeout_drops_item() {
        let broker = LoopbackBroker::new();
        broker.set_ack_delay(Duration::from_secs(30));
        let (writer, reader) = filled(1);
        writer.close();
        let settings = PublisherSettings {
            publish_timeout: Duration::from_secs(5),
            ..PublisherSettings::default()
        };

        let summary = BrokerPublisher::new(broker.session("unit-1"), reader, settings)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_pending_acknowledgement() {
        let broker = LoopbackBroker::new();
        broker.set_ack_delay(Duration::from_secs(3600));
        let (_writer, reader) = filled(1);
        let cancel = CancellationToken::new();
        let mut publisher = BrokerPublisher::new(broker.session("unit-1"), reader, settings(true));
        let recorder = Recorder::default();
        publisher.register_hook(recorder.clone());
        let task = tokio::spawn(publisher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.is_connected());
        let started = tokio::time::Instant::now();
        cancel.cancel();

        let summary = task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(summary.published, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(broker.published_count(), 0);
        assert!(!broker.is_connected());
        assert_eq!(
            recorder.0.lock().last().map(String::as_str),
            Some("disconnected:normal disconnection")
        );
        assert_eq!(Arc::strong_count(&recorder.0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_disconnect_keeps_items_queued_until_reconnected() {
        let broker = LoopbackBroker::new();
        let (writer, reader) = queue::bounded(queue::DEFAULT_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            BrokerPublisher::new(broker.session("unit-1"), reader, settings(true))
                .run(cancel.clone()),
        );

        writer.enqueue(measurement(1));
        broker.wait_for_published(1).await;

        broker.drop_connection(DisconnectReason::Broker("ServerShuttingDown".into()));
        writer.enqueue(measurement(2));
        writer.enqueue(measurement(3));
        broker.wait_for_published(3).await;

        cancel.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.connects, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(published_seconds(&broker), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_halts_draining_without_reconnect() {
        let broker = LoopbackBroker::new();
        let (writer, reader) = queue::bounded(queue::DEFAULT_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            BrokerPublisher::new(broker.session("unit-1"), reader, settings(false))
                .run(cancel.clone()),
        );

        writer.enqueue(measurement(1));
        broker.wait_for_published(1).await;
        broker.drop_connection(DisconnectReason::Transport("connection reset".into()));
        writer.enqueue(measurement(2));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(broker.published_count(), 1);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(writer.len(), 1);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_is_a_clean_exit() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let (_writer, reader) = queue::bounded::<Measurement>(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            BrokerPublisher::new(broker.session("unit-1"), reader, settings(true))
                .run(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.connects, 0);
        assert!(broker.connect_attempts() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_observe_lifecycle_and_are_cleared_on_shutdown() {
        let broker = LoopbackBroker::new();
        let recorder = Recorder::default();
        let (writer, reader) = filled(1);
        writer.close();

        let mut publisher = BrokerPublisher::new(broker.session("unit-1"), reader, settings(true));
        publisher.register_hook(recorder.clone());
        publisher.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                "connecting:unit-1".to_string(),
                "connected".to_string(),
                "disconnected:normal disconnection".to_string(),
            ]
        );
        // Publisher is consumed; the hook's Arc is the only remaining owner.
        assert_eq!(Arc::strong_count(&recorder.0), 1);
    }

    #[test]
    fn settings_follow_config() {
        let mqtt = MqttConfig {
            topic: "/lab/measurements".into(),
            qos: 0,
            connect_timeout_secs: 4,
            publish_timeout_secs: 6,
            ..MqttConfig::default()
        };
        let reliability = ReliabilityConfig {
            reconnect: false,
            reconnect_initial_backoff_secs: 3,
            reconnect_max_backoff_secs: 2,
            ..ReliabilityConfig::default()
        };

        let settings = PublisherSettings::from_config(&mqtt, &reliability);
        assert_eq!(settings.topic, "/lab/measurements");
        assert_eq!(settings.qos, QualityOfService::AtMostOnce);
        assert_eq!(settings.connect_timeout, Duration::from_secs(4));
        assert_eq!(settings.publish_timeout, Duration::from_secs(6));
        // Half of the default 5s shutdown timeout.
        assert_eq!(settings.disconnect_timeout, Duration::from_millis(2500));
        assert!(!settings.reconnect);
        assert_eq!(settings.max_backoff, Duration::from_secs(3));
    }
}

//! MQTT 5 session over TLS 1.3, built on `rumqttc`.
//!
//! Each [`BrokerSession::connect`] creates a fresh client/event-loop pair so
//! a reconnect never inherits requests queued on a dead link. The event loop
//! is only polled from inside session calls, which keeps every operation
//! strictly serial.

use super::{tls, BrokerError, BrokerSession, DisconnectReason, QualityOfService, SessionEvent};
use crate::config::MqttConfig;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, DisconnectReasonCode, Packet, PubAckReason};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::{Outgoing, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_CHANNEL_CAPACITY: usize = 16;

struct Link {
    client: AsyncClient,
    eventloop: EventLoop,
}

pub struct MqttSession {
    client_id: String,
    host: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout_secs: u64,
    tls: Arc<rustls::ClientConfig>,
    link: Option<Link>,
}

impl MqttSession {
    /// Prepare a session; loads the TLS identity eagerly so bad certificate
    /// material fails at startup rather than on first connect.
    pub fn new(config: &MqttConfig, client_id: impl Into<String>) -> anyhow::Result<Self> {
        let tls = tls::build_client_config(config)?;
        Ok(Self {
            client_id: client_id.into(),
            host: config.broker.clone(),
            port: config.port,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout_secs: config.connect_timeout_secs,
            tls: Arc::new(tls),
            link: None,
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_start(true);
        options.set_connection_timeout(self.connect_timeout_secs);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::clone(&self.tls),
        )));
        options
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.link = None;
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BrokerError::Rejected(format!("{:?}", ack.code)));
                    }
                    debug!(host = %self.host, port = self.port, "CONNACK received");
                    self.link = Some(Link { client, eventloop });
                    return Ok(());
                }
                Ok(event) => debug!(?event, "MQTT event before CONNACK"),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerError::Rejected(format!("{code:?}")));
                }
                Err(e) => return Err(BrokerError::Connect(e.to_string())),
            }
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), BrokerError> {
        let link = self.link.as_mut().ok_or(BrokerError::NotConnected)?;
        if let Err(e) = link
            .client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await
        {
            self.link = None;
            return Err(BrokerError::Publish(e.to_string()));
        }

        let outcome = loop {
            match link.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(_))) if qos == QualityOfService::AtMostOnce => {
                    break Ok(());
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) if qos == QualityOfService::AtLeastOnce => {
                    break puback_outcome(&ack.reason);
                }
                Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                    break Err(BrokerError::Transport(
                        broker_disconnect_reason(disconnect.reason_code).to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => break Err(BrokerError::Publish(e.to_string())),
            }
        };

        if matches!(outcome, Err(BrokerError::Transport(_) | BrokerError::Publish(_))) {
            self.link = None;
        }
        outcome
    }

    async fn next_event(&mut self) -> SessionEvent {
        let Some(link) = self.link.as_mut() else {
            return SessionEvent::Disconnected(DisconnectReason::Transport(
                "no active connection".into(),
            ));
        };

        let event = match link.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                SessionEvent::Disconnected(broker_disconnect_reason(disconnect.reason_code))
            }
            Ok(_) => SessionEvent::Idle,
            Err(e) => SessionEvent::Disconnected(DisconnectReason::Transport(e.to_string())),
        };
        if matches!(event, SessionEvent::Disconnected(_)) {
            self.link = None;
        }
        event
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        link.client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        loop {
            match link.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                // The broker closing the socket after DISCONNECT is expected.
                Err(e) => {
                    debug!(error = %e, "Event loop ended during disconnect");
                    return Ok(());
                }
            }
        }
    }
}

fn to_mqtt_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn puback_outcome(reason: &PubAckReason) -> Result<(), BrokerError> {
    match reason {
        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
        other => Err(BrokerError::Rejected(format!("{other:?}"))),
    }
}

fn broker_disconnect_reason(code: DisconnectReasonCode) -> DisconnectReason {
    DisconnectReason::Broker(format!("{code:?}"))
}

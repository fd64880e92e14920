//! Broker connection lifecycle.
//!
//! ```text
//! Disconnected ──connect──► Connected ──publish fails──► Failed
//!       ▲                                                  │
//!       └──────────────── reconnect fails ◄────reconnect───┘
//! ```
//!
//! The supervisor is the only owner of the transport. Every failure drops the
//! transport session, so the next operation starts from a fresh connect.

use super::message::OutboundMessage;
use super::transport::{Ack, BrokerTransport, TransportError};
use chrono::{DateTime, Local};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct BrokerStatus {
    pub connection_state: ConnectionState,
    pub connects: u64,
    pub messages_sent: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Local>>,
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} after {} connects, {} sent, {} failures",
            self.connection_state, self.connects, self.messages_sent, self.failures
        )?;
        if let Some(error) = &self.last_error {
            write!(f, " (last error: {})", error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Connecting to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Cannot publish to '{topic}', broker {endpoint} unreachable: {source}")]
    Unreachable {
        topic: String,
        endpoint: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Publish to '{topic}' on {endpoint} not acknowledged within {timeout:?}")]
    Timeout {
        topic: String,
        endpoint: String,
        timeout: Duration,
    },

    #[error("Publish to '{topic}' on {endpoint} failed: {source}")]
    Broker {
        topic: String,
        endpoint: String,
        #[source]
        source: TransportError,
    },
}

impl PublishError {
    pub fn topic(&self) -> &str {
        match self {
            PublishError::Unreachable { topic, .. }
            | PublishError::Timeout { topic, .. }
            | PublishError::Broker { topic, .. } => topic,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::Unreachable { .. } => "unreachable",
            PublishError::Timeout { .. } => "timeout",
            PublishError::Broker { .. } => "broker",
        }
    }
}

pub struct ConnectionSupervisor {
    transport: Box<dyn BrokerTransport>,
    endpoint: String,
    connect_timeout: Duration,
    epoch: u64,
    status: BrokerStatus,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Box<dyn BrokerTransport>,
        endpoint: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        ConnectionSupervisor {
            transport,
            endpoint: endpoint.into(),
            connect_timeout,
            epoch: 0,
            status: BrokerStatus::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of sessions opened so far. Changes on every successful connect.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn status(&self) -> &BrokerStatus {
        &self.status
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.connection_state != state {
            debug!(
                "Broker connection {:?} -> {:?}",
                self.status.connection_state, state
            );
            self.status.connection_state = state;
        }
    }

    fn record_failure(&mut self, error: &dyn std::error::Error) {
        self.status.failures += 1;
        self.status.last_error = Some(error.to_string());
    }

    /// Opens a session unless one is already up.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        self.transport.reset();

        info!(endpoint = %self.endpoint, "Connecting to MQTT broker");
        let error = match time::timeout(self.connect_timeout, self.transport.connect()).await {
            Ok(Ok(())) => {
                self.epoch += 1;
                self.status.connects += 1;
                self.status.last_activity = Some(Local::now());
                self.set_state(ConnectionState::Connected);
                info!(endpoint = %self.endpoint, epoch = self.epoch, "MQTT session established");
                return Ok(());
            }
            Ok(Err(source)) => ConnectionError::Transport {
                endpoint: self.endpoint.clone(),
                source,
            },
            Err(_) => ConnectionError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.connect_timeout,
            },
        };

        self.transport.reset();
        self.record_failure(&error);
        self.set_state(ConnectionState::Disconnected);
        warn!(endpoint = %self.endpoint, error = %error, "MQTT connect failed");
        Err(error)
    }

    /// Drops the current session and opens a new one.
    pub async fn reconnect(&mut self) -> Result<(), ConnectionError> {
        self.transport.reset();
        self.set_state(ConnectionState::Disconnected);
        self.connect().await
    }

    /// Publishes `message`, connecting first if needed, and waits at most
    /// `timeout` for the acknowledgement.
    pub async fn publish(
        &mut self,
        message: &OutboundMessage,
        timeout: Duration,
    ) -> Result<Ack, PublishError> {
        if !self.is_connected() {
            if let Err(source) = self.connect().await {
                self.set_state(ConnectionState::Failed);
                return Err(PublishError::Unreachable {
                    topic: message.topic.clone(),
                    endpoint: self.endpoint.clone(),
                    source,
                });
            }
        }

        let error = match time::timeout(timeout, self.transport.publish(message)).await {
            Ok(Ok(ack)) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(Local::now());
                debug!("Published {} (ack {:?})", message, ack.packet_id);
                return Ok(ack);
            }
            Ok(Err(source)) => PublishError::Broker {
                topic: message.topic.clone(),
                endpoint: self.endpoint.clone(),
                source,
            },
            Err(_) => PublishError::Timeout {
                topic: message.topic.clone(),
                endpoint: self.endpoint.clone(),
                timeout,
            },
        };

        self.transport.reset();
        self.record_failure(&error);
        self.set_state(ConnectionState::Failed);
        Err(error)
    }

    /// Closes the session. Safe to call in any state and more than once.
    pub async fn disconnect(&mut self) {
        if self.is_connected() {
            match time::timeout(self.connect_timeout, self.transport.disconnect()).await {
                Ok(Ok(())) => info!(endpoint = %self.endpoint, "Disconnected from MQTT broker"),
                Ok(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "Unclean MQTT disconnect"),
                Err(_) => warn!(endpoint = %self.endpoint, "MQTT disconnect timed out"),
            }
        }
        self.transport.reset();
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message::MqQos;
    use crate::testing::{Op, ScriptedTransport, TransportLog};
    use tokio::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn supervisor(transport: ScriptedTransport) -> ConnectionSupervisor {
        ConnectionSupervisor::new(Box::new(transport), "broker:1883", Duration::from_secs(10))
    }

    fn message(topic: &str) -> OutboundMessage {
        OutboundMessage::new(topic, b"{}".to_vec(), MqQos::ExactlyOnce, false)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (transport, log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport);

        supervisor.connect().await.unwrap();
        supervisor.connect().await.unwrap();

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.epoch(), 1);
        assert_eq!(log.count(&Op::Connect), 1);
    }

    #[tokio::test]
    async fn publish_connects_lazily() {
        let (transport, log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport);

        let ack = supervisor.publish(&message("bme680"), TIMEOUT).await.unwrap();

        assert_eq!(ack.qos, MqQos::ExactlyOnce);
        assert_eq!(log.count(&Op::Connect), 1);
        assert_eq!(log.delivered("bme680"), 1);
        assert_eq!(supervisor.status().messages_sent, 1);
        assert!(supervisor.status().last_activity.is_some());
    }

    #[tokio::test]
    async fn status_summarizes_session_history() {
        let (transport, _log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport.fail_publishes("bme680", 1));

        assert!(supervisor.publish(&message("bme680"), TIMEOUT).await.is_err());
        supervisor.publish(&message("bme680"), TIMEOUT).await.unwrap();
        supervisor.disconnect().await;

        let status = supervisor.status();
        assert_eq!(status.connects, 2);
        assert_eq!(status.messages_sent, 1);
        assert_eq!(status.failures, 1);
        assert!(status
            .to_string()
            .starts_with("Disconnected after 2 connects, 1 sent, 1 failures (last error: "));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_publish() {
        let (transport, log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport.refuse_connects(usize::MAX));

        let err = supervisor.publish(&message("bme680"), TIMEOUT).await.unwrap_err();

        assert!(matches!(err, PublishError::Unreachable { .. }));
        assert_eq!(err.topic(), "bme680");
        assert!(err.to_string().contains("broker:1883"));
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert!(log.publishes("bme680").is_empty());
        assert_eq!(supervisor.status().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_bounded_by_timeout() {
        let (transport, _log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport.hang_connects(1));
        let start = Instant::now();

        let err = supervisor.connect().await.unwrap_err();

        assert!(matches!(err, ConnectionError::Timeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);

        supervisor.connect().await.unwrap();
        assert_eq!(supervisor.epoch(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_publish_times_out_and_next_publish_reconnects() {
        let (transport, log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport.hang_publishes("bme680", 1));
        let start = Instant::now();

        let err = supervisor.publish(&message("bme680"), TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(start.elapsed(), TIMEOUT);
        assert_eq!(supervisor.state(), ConnectionState::Failed);

        supervisor.publish(&message("bme680"), TIMEOUT).await.unwrap();
        assert_eq!(supervisor.epoch(), 2);
        assert_eq!(log.count(&Op::Connect), 2);
    }

    #[tokio::test]
    async fn broker_error_marks_connection_failed() {
        let (transport, _log) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport.fail_publishes("bme680", 1));

        let err = supervisor.publish(&message("bme680"), TIMEOUT).await.unwrap_err();

        assert!(matches!(err, PublishError::Broker { .. }));
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert!(supervisor.status().last_error.is_some());

        supervisor.reconnect().await.unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (transport, log): (_, TransportLog) = ScriptedTransport::new();
        let mut supervisor = supervisor(transport);

        supervisor.disconnect().await;
        supervisor.connect().await.unwrap();
        supervisor.disconnect().await;
        supervisor.disconnect().await;

        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(log.count(&Op::Disconnect), 1);
    }
}

//! Broker transport seam.
//!
//! The supervisor only needs three operations from a client library. Timeouts
//! are applied by the caller, so implementations may wait indefinitely.

use super::message::{MqQos, OutboundMessage};
use async_trait::async_trait;
use rumqttc::ConnectReturnCode;
use thiserror::Error;

/// Broker confirmation for one publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub qos: MqQos,
    /// `None` for QoS 0, which has no packet identifier.
    pub packet_id: Option<u16>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] rumqttc::ConnectionError),

    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Connection refused by broker: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("No broker session")]
    NotConnected,

    #[error("Broker closed the session")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait BrokerTransport: Send {
    /// Opens a fresh session and waits for the broker to accept it.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Publishes and waits for the acknowledgement matching the message QoS.
    async fn publish(&mut self, message: &OutboundMessage) -> Result<Ack, TransportError>;

    /// Sends DISCONNECT and closes the session.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Drops the session without talking to the broker.
    fn reset(&mut self);
}

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
};
use tokio::time;
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::message::{MqQos, OutboundMessage};
use super::transport::{Ack, BrokerTransport, TransportError};

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 16;

/// Upper bound for flushing DISCONNECT on shutdown.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(2);

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(60);
const MAX_KEEP_ALIVE: Duration = Duration::from_secs(u16::MAX as u64);

struct Session {
    client: AsyncClient,
    event_loop: EventLoop,
}

/// rumqttc-backed transport.
///
/// The event loop is only polled while an operation is in progress, so no
/// background task is needed. Pings are not sent while the daemon sleeps;
/// [`keep_alive_for`] sizes the keep-alive so the broker tolerates that.
pub struct MqttHandler {
    options: MqttOptions,
    session: Option<Session>,
}

/// Keep-alive that outlasts the longest idle gap between two operations.
pub fn keep_alive_for(poll_interval: Duration, backoff: Duration) -> Duration {
    let idle = poll_interval.max(backoff);
    idle.saturating_mul(2).clamp(MIN_KEEP_ALIVE, MAX_KEEP_ALIVE)
}

impl MqttHandler {
    pub fn new(config: &MqttConfig, client_id: &str, keep_alive: Duration) -> Self {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(keep_alive).set_clean_session(true);
        if let Some(user) = &config.username {
            options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }

        debug!(
            "MQTT options: client_id={} endpoint={} keep_alive={:?}",
            client_id,
            config.endpoint(),
            keep_alive
        );

        MqttHandler {
            options,
            session: None,
        }
    }

    async fn await_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            let event = match event_loop.poll().await {
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(TransportError::Refused(code))
                }
                other => other?,
            };
            match event {
                Event::Incoming(Packet::ConnAck(ConnAck { code, .. })) => {
                    return if code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(TransportError::Refused(code))
                    };
                }
                notification => debug!("Connect phase notification: {:?}", notification),
            }
        }
    }

    async fn await_ack(event_loop: &mut EventLoop, qos: MqQos) -> Result<Ack, TransportError> {
        let mut sent: Option<u16> = None;
        loop {
            match (event_loop.poll().await?, sent) {
                (Event::Outgoing(Outgoing::Publish(pkid)), None) => {
                    if qos == MqQos::AtMostOnce {
                        return Ok(Ack {
                            qos,
                            packet_id: None,
                        });
                    }
                    sent = Some(pkid);
                }
                (Event::Incoming(Packet::PubAck(ack)), Some(pkid))
                    if qos == MqQos::AtLeastOnce && ack.pkid == pkid =>
                {
                    return Ok(Ack {
                        qos,
                        packet_id: Some(pkid),
                    });
                }
                (Event::Incoming(Packet::PubComp(comp)), Some(pkid))
                    if qos == MqQos::ExactlyOnce && comp.pkid == pkid =>
                {
                    return Ok(Ack {
                        qos,
                        packet_id: Some(pkid),
                    });
                }
                (Event::Incoming(Packet::Disconnect), _) => return Err(TransportError::Closed),
                (notification, _) => debug!("Publish phase notification: {:?}", notification),
            }
        }
    }

    async fn send(session: &mut Session, message: &OutboundMessage) -> Result<Ack, TransportError> {
        session
            .client
            .publish(
                message.topic.clone(),
                message.qos.into(),
                message.retain,
                message.payload.clone(),
            )
            .await?;
        Self::await_ack(&mut session.event_loop, message.qos).await
    }

    async fn flush_disconnect(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match event_loop.poll().await? {
                Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
                notification => debug!("Disconnect phase notification: {:?}", notification),
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttHandler {
    async fn connect(&mut self) -> Result<(), TransportError> {
        // Stale sessions are discarded; the broker sees a clean session.
        self.session = None;

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        Self::await_connack(&mut event_loop).await?;

        info!(
            "Connected to MQTT broker {}:{}",
            self.options.broker_address().0,
            self.options.broker_address().1
        );
        self.session = Some(Session { client, event_loop });
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<Ack, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;

        let result = Self::send(session, message).await;
        if result.is_err() {
            self.session = None;
        }
        result
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        session.client.disconnect().await?;
        match time::timeout(DISCONNECT_FLUSH, Self::flush_disconnect(&mut session.event_loop)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("DISCONNECT not flushed within {:?}", DISCONNECT_FLUSH);
                Ok(())
            }
        }
    }

    fn reset(&mut self) {
        if self.session.take().is_some() {
            debug!("MQTT session dropped");
        }
    }
}

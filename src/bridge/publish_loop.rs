//! Sample-publish-retry loop with compile-time state safety via statum.
//!
//! ```text
//! Bootstrapping ─► Announcing ─► Sampling ─┬─► Publishing ─┬─► Sleeping ─┐
//!                                  ▲       │               └─► Backoff ──┤
//!                                  │       └─(sensor fault)─► Sleeping ──┤
//!                                  └─────────────────────────────────────┘
//! ```
//!
//! The loop never gives up on the broker. It stops on shutdown, on a fatal
//! sensor fault, or once the sensor failure budget is exhausted.

use crate::bridge::retry::RetryPolicy;
use crate::config::{Config, DiscoveryMode};
use crate::mqtt::message::{MqQos, OutboundMessage};
use crate::mqtt::supervisor::{ConnectionSupervisor, PublishError};
use crate::payload::{self, DiscoveryAnnouncer, SerializedReading};
use crate::sensor::{Sensor, SensorError, SensorSettings};
use chrono::{DateTime, Local};
use statum::{machine, state};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Sensor setup failed: {0}")]
    SensorInit(#[source] SensorError),

    #[error("No usable reading after {failures} consecutive attempts, last error: {last}")]
    Sensor { failures: u32, last: String },
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub data_topic: String,
    pub data_qos: MqQos,
    pub poll_interval: Duration,
    pub publish_timeout: Duration,
    pub discovery_mode: DiscoveryMode,
    pub sensor_settings: SensorSettings,
    pub sensor_failure_limit: u32,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        LoopSettings {
            data_topic: config.bridge.data_topic.clone(),
            data_qos: MqQos::ExactlyOnce,
            poll_interval: config.poll_interval(),
            publish_timeout: config.publish_timeout(),
            discovery_mode: config.discovery.mode,
            sensor_settings: SensorSettings::default(),
            sensor_failure_limit: config.sensor.failure_limit,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoopStats {
    pub cycles: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub sensor_failures: u64,
    pub discovery_sent: u64,
    pub discovery_failures: u64,
    pub last_published: Option<DateTime<Local>>,
}

impl fmt::Display for LoopStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} cycles, {} published, {} publish failures, {} sensor failures, discovery {} sent / {} failed",
            self.cycles,
            self.published,
            self.publish_failures,
            self.sensor_failures,
            self.discovery_sent,
            self.discovery_failures
        )
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LoopState {
    Bootstrapping, // Sensor setup and first connect
    Announcing,    // Initial discovery announcement
    Sampling,      // Reading and formatting one sample
    Publishing,    // Sending the formatted reading
    Sleeping,      // Waiting for the next poll
    Backoff,       // Waiting after a failed publish
}

#[machine]
pub struct PublishLoop<S: LoopState> {
    settings: LoopSettings,
    sensor: Box<dyn Sensor>,
    supervisor: ConnectionSupervisor,
    announcer: DiscoveryAnnouncer,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    pending: Option<SerializedReading>,
    discovery_attempted: bool,
    announced_epoch: Option<u64>,
    publish_failures: u32,
    sensor_failures: u32,
    stats: LoopStats,
}

pub enum SampleOutcome {
    Ready(PublishLoop<Publishing>),
    Skipped(PublishLoop<Sleeping>),
}

pub enum PublishOutcome {
    Delivered(PublishLoop<Sleeping>),
    Failed(PublishLoop<Backoff>),
}

pub enum Wake {
    Resume(PublishLoop<Sampling>),
    Stopped(LoopStats),
}

impl<S: LoopState> PublishLoop<S> {
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    fn announcement_due(&self) -> bool {
        match self.settings.discovery_mode {
            DiscoveryMode::Once => !self.discovery_attempted,
            DiscoveryMode::OnConnect => self.announced_epoch != Some(self.supervisor.epoch()),
        }
    }

    /// Sends the discovery descriptor if it is due and a session is up.
    /// Failures are logged and counted only.
    async fn announce_if_needed(&mut self) {
        if !self.announcement_due() {
            return;
        }
        if !self.supervisor.is_connected() {
            debug!("Discovery announcement pending until the broker is reachable");
            return;
        }

        self.discovery_attempted = true;
        self.announced_epoch = Some(self.supervisor.epoch());
        match self
            .announcer
            .send(&mut self.supervisor, self.settings.publish_timeout)
            .await
        {
            Ok(_) => self.stats.discovery_sent += 1,
            Err(e) => {
                self.stats.discovery_failures += 1;
                warn!(
                    topic = %e.topic(),
                    endpoint = %self.supervisor.endpoint(),
                    "Discovery announcement failed: {}",
                    e
                );
            }
        }
    }

    /// Sleeps for `delay`. Returns `false` if shutdown was requested.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    async fn finish(mut self) -> LoopStats {
        info!("Publish loop stopping");
        self.supervisor.disconnect().await;
        info!("Broker session: {}", self.supervisor.status());
        info!("Publish loop stopped: {}", self.stats);
        self.stats
    }
}

impl PublishLoop<Bootstrapping> {
    pub fn create(
        settings: LoopSettings,
        sensor: Box<dyn Sensor>,
        supervisor: ConnectionSupervisor,
        announcer: DiscoveryAnnouncer,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        debug!("Creating publish loop for topic '{}'", settings.data_topic);
        Self::new(
            settings,
            sensor,
            supervisor,
            announcer,
            retry,
            shutdown,
            None,  // pending
            false, // discovery_attempted
            None,  // announced_epoch
            0,     // publish_failures
            0,     // sensor_failures
            LoopStats::default(),
        )
    }

    /// Configures the sensor and makes a first connection attempt.
    /// Only the sensor setup can fail.
    pub async fn bootstrap(mut self) -> Result<PublishLoop<Announcing>, LoopError> {
        info!("Configuring {}", self.sensor.describe());
        if let Err(e) = self.sensor.configure(&self.settings.sensor_settings).await {
            error!("Sensor configuration failed: {}", e);
            return Err(LoopError::SensorInit(e));
        }

        if let Err(e) = self.supervisor.connect().await {
            warn!("Broker not reachable at startup, will retry on publish: {}", e);
        }
        Ok(self.transition())
    }

    /// Runs until shutdown or a sensor fault.
    pub async fn run(self) -> Result<LoopStats, LoopError> {
        let mut sampling = self.bootstrap().await?.announce().await;
        loop {
            let wake = match sampling.sample().await? {
                SampleOutcome::Ready(publishing) => match publishing.publish().await {
                    PublishOutcome::Delivered(sleeping) => sleeping.sleep().await,
                    PublishOutcome::Failed(backoff) => backoff.wait().await,
                },
                SampleOutcome::Skipped(sleeping) => sleeping.sleep().await,
            };
            match wake {
                Wake::Resume(next) => sampling = next,
                Wake::Stopped(stats) => return Ok(stats),
            }
        }
    }
}

impl PublishLoop<Announcing> {
    pub async fn announce(mut self) -> PublishLoop<Sampling> {
        self.announce_if_needed().await;
        self.transition()
    }
}

impl PublishLoop<Sampling> {
    /// Takes and formats one reading. A failed reading skips the cycle; the
    /// loop halts (after disconnecting) when the failure is fatal or the
    /// failure budget is used up.
    pub async fn sample(mut self) -> Result<SampleOutcome, LoopError> {
        self.stats.cycles += 1;

        let failure = match self.sensor.sample().await {
            Ok(raw) => match payload::format(&raw) {
                Ok(reading) => {
                    self.sensor_failures = 0;
                    debug!("Sampled {:?}", reading.reading());
                    self.pending = Some(reading);
                    return Ok(SampleOutcome::Ready(self.transition()));
                }
                Err(e) => (false, e.to_string()),
            },
            Err(e) => (e.is_fatal(), e.to_string()),
        };

        let (fatal, reason) = failure;
        self.sensor_failures += 1;
        self.stats.sensor_failures += 1;
        error!(
            failures = self.sensor_failures,
            "Skipping cycle, no usable reading: {}", reason
        );

        if fatal || self.sensor_failures >= self.settings.sensor_failure_limit {
            let failures = self.sensor_failures;
            self.finish().await;
            return Err(LoopError::Sensor {
                failures,
                last: reason,
            });
        }
        Ok(SampleOutcome::Skipped(self.transition()))
    }
}

impl PublishLoop<Publishing> {
    pub async fn publish(mut self) -> PublishOutcome {
        let Some(reading) = self.pending.take() else {
            warn!("No reading to publish");
            return PublishOutcome::Delivered(self.transition());
        };
        let message = OutboundMessage::new(
            self.settings.data_topic.clone(),
            reading.to_json().into_bytes(),
            self.settings.data_qos,
            false,
        );

        let result = match self.supervisor.connect().await {
            Ok(()) => {
                self.announce_if_needed().await;
                self.supervisor
                    .publish(&message, self.settings.publish_timeout)
                    .await
            }
            Err(source) => Err(PublishError::Unreachable {
                topic: message.topic.clone(),
                endpoint: self.supervisor.endpoint().to_string(),
                source,
            }),
        };

        match result {
            Ok(_) => {
                self.publish_failures = 0;
                self.stats.published += 1;
                self.stats.last_published = Some(Local::now());
                info!("Published reading to '{}'", message.topic);
                PublishOutcome::Delivered(self.transition())
            }
            Err(e) => {
                self.publish_failures += 1;
                self.stats.publish_failures += 1;
                error!(
                    topic = %e.topic(),
                    endpoint = %self.supervisor.endpoint(),
                    kind = e.kind(),
                    "Failed to publish reading: {}",
                    e
                );
                PublishOutcome::Failed(self.transition())
            }
        }
    }
}

impl PublishLoop<Sleeping> {
    pub async fn sleep(self) -> Wake {
        if self.pause(self.settings.poll_interval).await {
            Wake::Resume(self.transition())
        } else {
            Wake::Stopped(self.finish().await)
        }
    }
}

impl PublishLoop<Backoff> {
    pub async fn wait(self) -> Wake {
        let delay = self.retry.delay_for(self.publish_failures);
        warn!(
            failures = self.publish_failures,
            "Retrying in {}s",
            delay.as_secs()
        );
        if self.pause(delay).await {
            Wake::Resume(self.transition())
        } else {
            Wake::Stopped(self.finish().await)
        }
    }
}

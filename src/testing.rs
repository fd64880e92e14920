//! Scripted collaborators for unit tests.

use crate::mqtt::message::OutboundMessage;
use crate::mqtt::transport::{Ack, BrokerTransport, TransportError};
use crate::sensor::{RawSample, Sensor, SensorError, SensorSettings};
use async_trait::async_trait;
use rumqttc::ConnectReturnCode;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub fn reference_sample() -> RawSample {
    RawSample {
        temperature: 21.5,
        pressure: 1013.25,
        humidity: 45.678,
        gas_resistance: 12345.6,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect,
    Publish(String),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
    Hung,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub at: Instant,
    pub op: Op,
    pub outcome: Outcome,
    /// What was handed to the transport, for publishes.
    pub message: Option<OutboundMessage>,
}

/// Shared view of everything a [`ScriptedTransport`] was asked to do.
#[derive(Clone, Default)]
pub struct TransportLog(Arc<Mutex<Vec<Record>>>);

impl TransportLog {
    fn push(&self, op: Op, outcome: Outcome) {
        self.push_record(op, outcome, None);
    }

    fn push_publish(&self, message: &OutboundMessage, outcome: Outcome) {
        self.push_record(
            Op::Publish(message.topic.clone()),
            outcome,
            Some(message.clone()),
        );
    }

    fn push_record(&self, op: Op, outcome: Outcome, message: Option<OutboundMessage>) {
        self.0.lock().unwrap().push(Record {
            at: Instant::now(),
            op,
            outcome,
            message,
        });
    }

    pub fn records(&self) -> Vec<Record> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, op: &Op) -> usize {
        self.records().iter().filter(|r| &r.op == op).count()
    }

    pub fn publishes(&self, topic: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.op == Op::Publish(topic.to_string()))
            .collect()
    }

    pub fn delivered(&self, topic: &str) -> usize {
        self.publishes(topic)
            .iter()
            .filter(|r| r.outcome == Outcome::Ok)
            .count()
    }

    /// Messages on `topic` the transport acknowledged, in order.
    pub fn delivered_messages(&self, topic: &str) -> Vec<OutboundMessage> {
        self.publishes(topic)
            .into_iter()
            .filter(|r| r.outcome == Outcome::Ok)
            .filter_map(|r| r.message)
            .collect()
    }

    /// Whole seconds since `origin` of every publish attempt on `topic`.
    pub fn publish_offsets(&self, topic: &str, origin: Instant) -> Vec<u64> {
        self.publishes(topic)
            .iter()
            .map(|r| r.at.duration_since(origin).as_secs())
            .collect()
    }
}

/// Broker double with per-topic failure scripts.
pub struct ScriptedTransport {
    log: TransportLog,
    connected: bool,
    refused_connects: usize,
    hung_connects: usize,
    failures: HashMap<String, usize>,
    hangs: HashMap<String, usize>,
    cancel_after: Option<(String, usize, CancellationToken)>,
    next_packet_id: u16,
}

impl ScriptedTransport {
    pub fn new() -> (Self, TransportLog) {
        let log = TransportLog::default();
        let transport = ScriptedTransport {
            log: log.clone(),
            connected: false,
            refused_connects: 0,
            hung_connects: 0,
            failures: HashMap::new(),
            hangs: HashMap::new(),
            cancel_after: None,
            next_packet_id: 1,
        };
        (transport, log)
    }

    /// Refuses the first `n` connection attempts. `usize::MAX` refuses forever.
    pub fn refuse_connects(mut self, n: usize) -> Self {
        self.refused_connects = n;
        self
    }

    pub fn hang_connects(mut self, n: usize) -> Self {
        self.hung_connects = n;
        self
    }

    /// Fails the first `n` publishes on `topic` and drops the session.
    pub fn fail_publishes(mut self, topic: &str, n: usize) -> Self {
        self.failures.insert(topic.to_string(), n);
        self
    }

    /// The first `n` publishes on `topic` never get acknowledged.
    pub fn hang_publishes(mut self, topic: &str, n: usize) -> Self {
        self.hangs.insert(topic.to_string(), n);
        self
    }

    /// Cancels `token` once `n` publishes on `topic` were delivered.
    pub fn cancel_after(mut self, topic: &str, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((topic.to_string(), n, token));
        self
    }
}

fn take_one(budget: &mut usize) -> bool {
    match *budget {
        0 => false,
        usize::MAX => true,
        _ => {
            *budget -= 1;
            true
        }
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if take_one(&mut self.hung_connects) {
            self.log.push(Op::Connect, Outcome::Hung);
            return std::future::pending().await;
        }
        if take_one(&mut self.refused_connects) {
            self.log.push(Op::Connect, Outcome::Failed);
            return Err(TransportError::Refused(ConnectReturnCode::ServiceUnavailable));
        }
        self.log.push(Op::Connect, Outcome::Ok);
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<Ack, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if take_one(self.hangs.entry(message.topic.clone()).or_default()) {
            self.log.push_publish(message, Outcome::Hung);
            return std::future::pending().await;
        }
        if take_one(self.failures.entry(message.topic.clone()).or_default()) {
            self.log.push_publish(message, Outcome::Failed);
            self.connected = false;
            return Err(TransportError::Closed);
        }

        self.log.push_publish(message, Outcome::Ok);
        if let Some((topic, n, token)) = &self.cancel_after {
            if topic == &message.topic && self.log.delivered(topic) >= *n {
                token.cancel();
            }
        }

        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        Ok(Ack {
            qos: message.qos,
            packet_id: Some(packet_id),
        })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.log.push(Op::Disconnect, Outcome::Ok);
        self.connected = false;
        Ok(())
    }

    fn reset(&mut self) {
        self.connected = false;
    }
}

/// Sensor double returning queued results, then a fixed sample.
pub struct ScriptedSensor {
    configure_error: Option<SensorError>,
    queued: VecDeque<Result<RawSample, SensorError>>,
    fallback: RawSample,
    samples_taken: Arc<Mutex<usize>>,
}

impl ScriptedSensor {
    pub fn new() -> Self {
        ScriptedSensor {
            configure_error: None,
            queued: VecDeque::new(),
            fallback: reference_sample(),
            samples_taken: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing_configure(mut self, error: SensorError) -> Self {
        self.configure_error = Some(error);
        self
    }

    pub fn then(mut self, result: Result<RawSample, SensorError>) -> Self {
        self.queued.push_back(result);
        self
    }

    pub fn samples_taken(&self) -> Arc<Mutex<usize>> {
        self.samples_taken.clone()
    }
}

#[async_trait]
impl Sensor for ScriptedSensor {
    async fn configure(&mut self, _settings: &SensorSettings) -> Result<(), SensorError> {
        match self.configure_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn sample(&mut self) -> Result<RawSample, SensorError> {
        *self.samples_taken.lock().unwrap() += 1;
        self.queued.pop_front().unwrap_or(Ok(self.fallback))
    }

    fn describe(&self) -> String {
        "scripted sensor".to_string()
    }
}

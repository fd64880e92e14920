use std::fmt;

/// MQTT delivery guarantee, independent of the client library.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MqQos {
    AtMostOnce,
    AtLeastOnce,
    #[default]
    ExactlyOnce,
}

impl MqQos {
    pub fn level(self) -> u8 {
        match self {
            MqQos::AtMostOnce => 0,
            MqQos::AtLeastOnce => 1,
            MqQos::ExactlyOnce => 2,
        }
    }
}

impl From<MqQos> for rumqttc::QoS {
    fn from(qos: MqQos) -> Self {
        match qos {
            MqQos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            MqQos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            MqQos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: MqQos,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: MqQos, retain: bool) -> Self {
        OutboundMessage {
            topic: topic.into(),
            payload,
            qos,
            retain,
        }
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (qos {}{}, {} bytes)",
            self.topic,
            self.qos.level(),
            if self.retain { ", retained" } else { "" },
            self.payload.len()
        )
    }
}

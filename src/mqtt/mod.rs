//! # MQTT Integration Module
//!
//! Publishes readings and the discovery descriptor to an MQTT broker. The
//! daemon only ever publishes; nothing is subscribed.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - broker endpoint and session settings
//! ├── message.rs       - outbound message and QoS
//! ├── transport.rs     - BrokerTransport trait seam
//! ├── mqtt_handler.rs  - rumqttc implementation of the transport
//! └── supervisor.rs    - connection state machine and publish timeouts
//! ```
//!
//! The [`supervisor::ConnectionSupervisor`] owns exactly one transport. It
//! connects lazily, bounds every broker interaction with a timeout, and
//! reports failures as [`supervisor::PublishError`] values carrying the topic,
//! the broker endpoint and the cause. Retrying is left to the caller.

pub mod config;
pub mod message;
pub mod mqtt_handler;
pub mod supervisor;
pub mod transport;

//! # Sensor → Broker Bridge
//!
//! ```text
//! bridge/
//! ├── retry.rs         - delay policy after a failed publish
//! └── publish_loop.rs  - statum state machine driving sample, publish, sleep
//! ```
//!
//! One tokio task runs the loop. Suspension points are the poll sleep, the
//! backoff sleep and the bounded publish wait; the sleeps end early when the
//! shutdown token is cancelled.

pub mod publish_loop;
pub mod retry;

pub use publish_loop::{LoopError, LoopSettings, LoopStats, PublishLoop};
pub use retry::RetryPolicy;

//! # Payloads
//!
//! Everything that ends up on the wire.
//!
//! ```text
//! payload/
//! ├── schema.rs     - the single list of payload fields
//! ├── reading.rs    - raw sample → state topic JSON
//! └── discovery.rs  - Home Assistant device discovery descriptor
//! ```
//!
//! Both the reading formatter and the discovery descriptor are derived from
//! [`schema::PAYLOAD_FIELDS`], so every `value_template` advertised to Home
//! Assistant points at a key the formatter actually emits.

pub mod discovery;
pub mod reading;
pub mod schema;

pub use discovery::{build_descriptor, DiscoveryAnnouncer, DiscoveryDescriptor};
pub use reading::{format, FormatError, Reading, SerializedReading};

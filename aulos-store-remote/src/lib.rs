//! Client for the store daemon's worker protocol: a length-framed,
//! versioned request/response protocol spoken over a local Unix socket,
//! multiplexed over a bounded pool of reusable connections.
//!
//! The entry point is [`DaemonStore`]; construct it from a
//! [`ClientSettings`] snapshot and call one async method per store
//! operation. Version negotiation, compatibility fallbacks for older
//! daemons, and the interleaved stderr/log sub-protocol are handled
//! internally.

pub mod client;
pub mod error;
pub mod framed;
pub mod logger;
pub mod protocol;
pub mod serialization;
pub mod settings;


pub use client::{ClientMetrics, DaemonStore, StoreUri};
pub use error::ProtocolError;
pub use logger::{ActivityLogger, LoggerField, TracingLogger};
pub use protocol::{ProtocolVersion, PROTOCOL_VERSION};
pub use settings::{ClientSettings, Verbosity, DEFAULT_SOCKET_PATH};

//! Client side of the shellbridge terminal connection.
//!
//! [`protocol::Protocol`] is the pure connection state machine: backoff,
//! disconnect-duration tracking and status polling. [`connection`] drives it
//! with a real WebSocket, HTTP status requests and tokio timers.

pub mod connection;
pub mod error;
pub mod protocol;

pub use connection::{ClientConnection, ClientEvent, ClientHandle, ClientOptions, Delivery};
pub use error::{ClientError, Result};
pub use protocol::{Connectivity, Protocol, ProtocolSettings};

//! # relaymux-transport
//!
//! The single control-channel connection to the relay gateway.
//!
//! - [`Connector`]: how a [`ControlChannel`] is established (WebSocket in
//!   production, in-memory in tests)
//! - [`TransportSession`]: connection state machine, frame encode/decode,
//!   flat reconnect backoff, and per-stream pause/resume of inbound frames

#![deny(unsafe_code)]

pub mod channel;
pub mod errors;
mod flow;
pub mod session;
pub mod testing;
pub mod ws;

pub use channel::{ControlChannel, Connector};
pub use errors::TransportError;
pub use session::{ConnectionState, TransportConfig, TransportEvent, TransportSession};
pub use ws::WsConnector;

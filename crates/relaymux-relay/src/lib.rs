//! # relaymux-relay
//!
//! Multiplexes many virtual TCP streams over one transport session.
//!
//! - [`stream`]: per-stream state machine and pending-write buffer
//! - [`registry`]: id → stream map with unique create and idempotent remove
//! - [`socket`]: the outbound socket provider interface and a TCP provider
//! - [`coordinator`]: single-owner event loop bridging frames and sockets
//! - [`relay`]: process host with `start`/`stop` and status notifications

#![deny(unsafe_code)]

mod bridge;
pub mod coordinator;
pub mod registry;
pub mod relay;
pub mod socket;
pub mod status;
pub mod stream;
pub mod testing;

pub use coordinator::{CoordinatorConfig, RelayCoordinator, RelayEvent};
pub use registry::StreamRegistry;
pub use relay::{Relay, RelayConfig};
pub use socket::{BoxedSocket, RelaySocket, SocketProvider, TcpSocketProvider};
pub use status::{RelayStatus, StatusPublisher};
pub use stream::{CloseMode, Stream, StreamState};

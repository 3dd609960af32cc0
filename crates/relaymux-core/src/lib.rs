//! # relaymux-core
//!
//! Shared vocabulary for the relay multiplexer crates:
//!
//! - **Frames**: the JSON control-channel messages (`connect`, `data`, `close`, ...)
//! - **Stream ids**: [`StreamId`] newtype for the counterparty-assigned identifier
//! - **Destinations**: validated `host:port` pairs for outbound sockets
//! - **Errors**: [`RelayError`] taxonomy with stable `error_kind()` labels
//! - **Constants**: protocol defaults and metric names

#![deny(unsafe_code)]

pub mod constants;
pub mod destination;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod metrics;

pub use destination::Destination;
pub use errors::{RelayError, Result};
pub use frame::{ConnectStatus, Frame};
pub use ids::StreamId;

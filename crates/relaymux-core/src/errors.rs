//! Relay error taxonomy.
//!
//! Every variant is contained to the stream it concerns except
//! [`RelayError::TransportLost`], which cascades to every live stream. The
//! `Display` text is what travels back to the counterparty in
//! `connect_response.error`.

use thiserror::Error;

use crate::ids::StreamId;

/// Errors raised while relaying frames and sockets.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A control-channel payload could not be interpreted as a frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A `connect` reused an id that is still live.
    #[error("duplicate id")]
    DuplicateId(StreamId),

    /// The `connect` frame carried no usable host or port.
    #[error("{0}")]
    InvalidDestination(String),

    /// The socket provider failed to open the destination.
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),

    /// The control channel went away.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// A frame referenced an id with no live stream.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    /// A stream was asked to do something its current state forbids.
    #[error("stream {id} cannot {action} while {state}")]
    InvalidState {
        /// Stream concerned.
        id: StreamId,
        /// State the stream was in.
        state: &'static str,
        /// Operation that was refused.
        action: &'static str,
    },
}

impl RelayError {
    /// Stable snake_case label for logs and metric labels.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::DuplicateId(_) => "duplicate_id",
            Self::InvalidDestination(_) => "invalid_destination",
            Self::DestinationUnreachable(_) => "destination_unreachable",
            Self::TransportLost(_) => "transport_lost",
            Self::UnknownStream(_) => "unknown_stream",
            Self::InvalidState { .. } => "invalid_state",
        }
    }

    /// Whether this error tears down every stream rather than just one.
    pub fn is_transport_level(&self) -> bool {
        matches!(self, Self::TransportLost(_))
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

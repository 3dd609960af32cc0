//! Outbound destination addresses.

use std::fmt;

use crate::constants::{ERR_INVALID_PORT, ERR_MISSING_DESTINATION};
use crate::errors::{RelayError, Result};

/// A validated `host:port` pair a stream is bridged to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    /// Validate and normalise a host and port.
    ///
    /// Surrounding whitespace is trimmed and bracketed IPv6 literals
    /// (`[::1]`) are unbracketed so they resolve as plain addresses.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let trimmed = host.trim();
        let host = trimmed
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(trimmed);
        if host.is_empty() {
            return Err(RelayError::InvalidDestination(ERR_MISSING_DESTINATION.into()));
        }
        if port == 0 {
            return Err(RelayError::InvalidDestination(ERR_INVALID_PORT.into()));
        }
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }

    /// Build from the optional fields of a `connect` frame.
    pub fn from_frame_fields(host: Option<&str>, port: Option<i64>) -> Result<Self> {
        let (Some(host), Some(port)) = (host, port) else {
            return Err(RelayError::InvalidDestination(ERR_MISSING_DESTINATION.into()));
        };
        let port = u16::try_from(port)
            .map_err(|_| RelayError::InvalidDestination(ERR_INVALID_PORT.into()))?;
        Self::new(host, port)
    }

    /// Host name or address literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

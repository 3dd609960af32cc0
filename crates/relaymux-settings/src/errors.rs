//! Why relay settings could not be produced.

use std::path::PathBuf;

use thiserror::Error;

/// A settings file that could not be used, or a value the relay cannot run with.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but reading it failed.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not JSON, or a key holds a value of the wrong type.
    #[error("malformed settings in {}: {source}", path.display())]
    Malformed {
        /// File that was parsed.
        path: PathBuf,
        /// Parser error, with line and column where available.
        #[source]
        source: serde_json::Error,
    },
    /// Rejected by [`RelaySettings::validate`](crate::RelaySettings::validate).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

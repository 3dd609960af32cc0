//! # relaymux-settings
//!
//! Configuration with layered sources for the relay agent.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`RelaySettings::default()`])
//! 2. **Settings file**: `$RELAYMUX_SETTINGS` or `~/.relaymux/settings.json`,
//!    laid over the defaults key by key
//! 3. **Environment variables**: `RELAYMUX_*` overrides (highest priority)
//!
//! Command-line flags are applied by the binary on top, followed by
//! [`RelaySettings::validate`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, overlay, settings_path};
pub use types::*;

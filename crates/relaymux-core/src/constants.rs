//! Protocol constants and defaults.

use std::time::Duration;

/// Fixed delay between a failure-triggered disconnect and the next connect
/// attempt. No exponential growth, no jitter, no attempt cap.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Default control-channel URL.
pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:8080/ws";

/// Timeout for one control-channel connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the outbound frame queue between callers and the channel writer.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Largest payload carried by one outbound `data` frame, and the socket read size.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4096;

/// Pending-write level at which inbound `data` for a stream is paused.
pub const DEFAULT_HIGH_WATER_MARK: usize = 256 * 1024;

/// Pending-write level at which a paused stream is resumed.
pub const DEFAULT_LOW_WATER_MARK: usize = 64 * 1024;

/// Outbound socket connect timeout used by the TCP socket provider.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a closing stream may spend flushing before it is force-closed.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// `connect_response.error` for a connect that reuses a live id.
pub const ERR_DUPLICATE_ID: &str = "duplicate id";

/// `connect_response.error` for a connect without a usable host or port.
pub const ERR_MISSING_DESTINATION: &str = "Missing host or port";

/// `connect_response.error` for a port outside 1..=65535.
pub const ERR_INVALID_PORT: &str = "invalid port";

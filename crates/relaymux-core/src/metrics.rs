//! Metric name constants to avoid typos across crates.

/// Control-channel connections established (counter).
pub const TRANSPORT_CONNECTS_TOTAL: &str = "transport_connects_total";
/// Control-channel connections lost or closed (counter, labels: reason).
pub const TRANSPORT_DISCONNECTS_TOTAL: &str = "transport_disconnects_total";
/// Reconnect attempts scheduled after a failure (counter).
pub const TRANSPORT_RECONNECTS_SCHEDULED_TOTAL: &str = "transport_reconnects_scheduled_total";
/// Outbound frames dropped instead of sent (counter, labels: reason).
pub const TRANSPORT_FRAMES_DROPPED_TOTAL: &str = "transport_frames_dropped_total";
/// Inbound payloads that failed to parse as a frame (counter).
pub const TRANSPORT_MALFORMED_FRAMES_TOTAL: &str = "transport_malformed_frames_total";
/// Streams that reached the open state (counter).
pub const RELAY_STREAMS_OPENED_TOTAL: &str = "relay_streams_opened_total";
/// Connect requests answered with a failure (counter, labels: error_kind).
pub const RELAY_STREAMS_FAILED_TOTAL: &str = "relay_streams_failed_total";
/// Streams currently counted as active (gauge).
pub const RELAY_STREAMS_ACTIVE: &str = "relay_streams_active";
/// Bytes read from outbound sockets and relayed to the peer (counter).
pub const RELAY_BYTES_IN_TOTAL: &str = "relay_bytes_in_total";
/// Bytes from the peer written to outbound sockets (counter).
pub const RELAY_BYTES_OUT_TOTAL: &str = "relay_bytes_out_total";
/// Times a stream crossed its high-water mark and paused inbound data (counter).
pub const RELAY_STREAMS_PAUSED_TOTAL: &str = "relay_streams_paused_total";

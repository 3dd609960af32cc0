//! Externally observed relay status.

use serde::Serialize;
use tokio::sync::watch;

/// What the UI sees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    /// Whether the control channel is up.
    pub connected: bool,
    /// Streams that opened and have not yet closed.
    pub active_connections: usize,
}

/// Publishes [`RelayStatus`] changes to any number of subscribers.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<RelayStatus>,
}

impl StatusPublisher {
    /// Publisher starting from the disconnected, idle status.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RelayStatus::default());
        Self { tx }
    }

    /// Replace the status. Subscribers are only notified when it changed.
    pub fn publish(&self, status: RelayStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    /// Latest published status.
    pub fn current(&self) -> RelayStatus {
        *self.tx.borrow()
    }

    /// Receiver that observes every later change.
    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let publisher = StatusPublisher::new();
        assert_eq!(
            publisher.current(),
            RelayStatus {
                connected: false,
                active_connections: 0
            }
        );
    }

    #[test]
    fn unchanged_status_is_not_notified() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();
        assert!(!publisher.publish(RelayStatus::default()));
        assert!(!rx.has_changed().unwrap());

        let up = RelayStatus {
            connected: true,
            active_connections: 0,
        };
        assert!(publisher.publish(up));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), up);
        assert!(!publisher.publish(up));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn publishes_without_subscribers() {
        let publisher = StatusPublisher::new();
        let status = RelayStatus {
            connected: true,
            active_connections: 3,
        };
        assert!(publisher.publish(status));
        assert_eq!(publisher.current(), status);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelayStatus {
            connected: true,
            active_connections: 2,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"connected": true, "activeConnections": 2}));
    }
}

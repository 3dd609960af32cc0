//! Process host for one transport session and its coordinator.
//!
//! [`Relay`] wires a [`TransportSession`] to a [`RelayCoordinator`] running on
//! its own task and exposes the lifecycle the host process needs:
//! `start`/`stop`, a toggle, status, and the destination identity.

use std::sync::Arc;

use parking_lot::Mutex;
use relaymux_transport::{
    ConnectionState, Connector, TransportConfig, TransportError, TransportSession,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::{CoordinatorConfig, RelayCoordinator, RelayEvent};
use crate::socket::SocketProvider;
use crate::status::RelayStatus;

/// Everything needed to build a [`Relay`].
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    /// Control-channel tuning.
    pub transport: TransportConfig,
    /// Stream tuning.
    pub coordinator: CoordinatorConfig,
    /// Destination identity announced after each connect.
    pub identity: Option<String>,
}

/// A running relay: one session, one coordinator task.
pub struct Relay {
    transport: TransportSession,
    events: mpsc::UnboundedSender<RelayEvent>,
    status: watch::Receiver<RelayStatus>,
    identity: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Build the session and spawn the coordinator. Does not connect.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        provider: Arc<dyn SocketProvider>,
        config: RelayConfig,
    ) -> Self {
        let transport = TransportSession::new(connector, config.transport);
        let (coordinator, inbox) = RelayCoordinator::new(
            transport.clone(),
            provider,
            config.coordinator,
            config.identity.clone(),
        );
        let events = coordinator.sender();
        let status = coordinator.status().subscribe();
        let task = tokio::spawn(coordinator.run(inbox));
        Self {
            transport,
            events,
            status,
            identity: Mutex::new(config.identity),
            task: Mutex::new(Some(task)),
        }
    }

    /// Connect if a destination identity is configured.
    ///
    /// A failed first attempt is returned, and a reconnect is already
    /// scheduled by then.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.identity.lock().is_none() {
            info!("no destination identity configured, staying disconnected");
            return Ok(());
        }
        self.transport.connect().await
    }

    /// Disconnect and cancel any scheduled reconnect.
    pub fn stop(&self) {
        self.transport.disconnect();
    }

    /// Connect when disconnected, disconnect otherwise.
    pub async fn toggle_connection(&self) -> Result<(), TransportError> {
        match self.transport.state() {
            ConnectionState::Disconnected => self.transport.connect().await,
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.stop();
                Ok(())
            }
        }
    }

    /// Latest status.
    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Receiver notified whenever the status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    /// Set the identity announced to the gateway. Announced right away when
    /// connected, and after every later connect.
    pub fn set_destination_identity(&self, identity: impl Into<String>) {
        let identity = identity.into();
        *self.identity.lock() = Some(identity.clone());
        let _ = self.events.send(RelayEvent::SetIdentity(Some(identity)));
    }

    /// Current destination identity.
    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    /// The underlying session.
    pub fn transport(&self) -> &TransportSession {
        &self.transport
    }

    /// Disconnect, close every stream, and wait for the coordinator to stop.
    pub async fn shutdown(&self) {
        self.stop();
        self.transport.clear_handler();
        let _ = self.events.send(RelayEvent::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            debug!("relay shut down");
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            self.transport.disconnect();
            task.abort();
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("state", &self.transport.state())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

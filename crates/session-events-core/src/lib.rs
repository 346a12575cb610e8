//! Real-time event distribution core: transactional publish, cross-pod
//! distribution via Postgres LISTEN/NOTIFY, and per-client subscription with
//! catch-up.

pub mod catchup;
pub mod connection_manager;
pub mod event_store;
pub mod notify_listener;
pub mod protocol;
pub mod publisher;

pub use catchup::{CatchupEvent, CatchupQuerier, CatchupResult};
pub use connection_manager::{ClientSink, ClientSource, ConnectionManager};
pub use event_store::{EventStore, StoredEvent};
pub use notify_listener::{NotificationSink, NotifyListener, NotifyListenerHandle};
pub use protocol::{ClientAction, ClientFrame, ServerFrame};
pub use publisher::Publisher;

use std::sync::{Arc, OnceLock};

use sqlx::PgPool;
use tokio::task::JoinHandle;

use session_events_common::{CatchupConfig, ClientConfig, ListenerConfig};

/// Forwards dispatch to a `ConnectionManager` that does not exist yet at the
/// time the Notify Listener is spawned. Breaks the Manager <-> Listener
/// construction cycle (§9 design notes): the Listener is spawned first
/// against this placeholder, and the slot is filled once the Manager is
/// built from the Listener's own handle.
struct DeferredSink(Arc<OnceLock<Arc<ConnectionManager>>>);

impl NotificationSink for DeferredSink {
    fn dispatch(&self, channel: &str, payload: &str) {
        if let Some(manager) = self.0.get() {
            manager.dispatch(channel, payload);
        }
    }
}

/// Everything a pod needs to run: the shared pool-backed components plus the
/// dedicated-connection Notify Listener task. Constructed once per pod.
pub struct EventCore {
    pub publisher: Publisher,
    pub connection_manager: Arc<ConnectionManager>,
    listener_task: JoinHandle<()>,
    listener_handle: NotifyListenerHandle,
}

impl EventCore {
    pub fn bootstrap(
        pool: PgPool,
        listener_config: ListenerConfig,
        client_config: ClientConfig,
        catchup_config: CatchupConfig,
    ) -> Self {
        let store = EventStore::new(pool.clone());
        let publisher = Publisher::new(pool.clone());
        let catchup = CatchupQuerier::new(store);

        let manager_slot: Arc<OnceLock<Arc<ConnectionManager>>> = Arc::new(OnceLock::new());
        let (listener_handle, listener_task) = notify_listener::spawn(
            pool,
            listener_config,
            Arc::new(DeferredSink(manager_slot.clone())),
        );

        let connection_manager = Arc::new(ConnectionManager::new(
            listener_handle.clone(),
            catchup,
            &client_config,
            catchup_config.max_events_per_response,
        ));
        let _ = manager_slot.set(connection_manager.clone());

        Self {
            publisher,
            connection_manager,
            listener_task,
            listener_handle,
        }
    }

    pub fn listener_handle(&self) -> &NotifyListenerHandle {
        &self.listener_handle
    }

    /// Drives the documented shutdown sequence (§4.3): stop new
    /// subscribe/unsubscribe submissions, then join the receive loop so no
    /// outstanding statement is left in flight.
    pub async fn shutdown(self) {
        notify_listener::shutdown(&self.listener_handle);
        let _ = self.listener_task.await;
    }
}

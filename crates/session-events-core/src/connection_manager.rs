//! Connection Manager: client registry, channel membership, and the
//! subscribe/unsubscribe/catchup/ping protocol (§4.4).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use session_events_common::ClientConfig;

use crate::catchup::CatchupQuerier;
use crate::notify_listener::{NotificationSink, NotifyListenerHandle};
use crate::protocol::{ClientAction, ClientFrame, ServerFrame};

/// Source half of a client transport: yields one text frame per call, `None`
/// on a closed socket. Owned exclusively by the per-connection reader loop.
#[async_trait]
pub trait ClientSource: Send {
    async fn recv(&mut self) -> Option<String>;
}

/// Sink half of a client transport. Owned exclusively by the per-connection
/// writer task, fed by a bounded channel; never touched by the fan-out path.
#[async_trait]
pub trait ClientSink: Send {
    async fn send(&mut self, text: String) -> bool;
}

type Connections = Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>;
type Channels = Arc<RwLock<HashMap<String, HashSet<Uuid>>>>;

pub struct ConnectionManager {
    connections: Connections,
    channels: Channels,
    listener: NotifyListenerHandle,
    catchup: CatchupQuerier,
    catchup_max: i64,
    write_timeout: Duration,
    outbound_buffer: usize,
}

impl ConnectionManager {
    pub fn new(
        listener: NotifyListenerHandle,
        catchup: CatchupQuerier,
        config: &ClientConfig,
        catchup_max: i64,
    ) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            listener,
            catchup,
            catchup_max,
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            outbound_buffer: config.outbound_buffer,
        }
    }

    /// Drives one client connection end to end: registers it, spawns its
    /// writer task, reads frames until the socket closes, then runs
    /// deterministic cleanup regardless of which exit path was taken.
    #[instrument(skip(self, source, sink))]
    pub async fn handle_connection(
        &self,
        mut source: Box<dyn ClientSource>,
        mut sink: Box<dyn ClientSink>,
    ) {
        let connection_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel::<String>(self.outbound_buffer);

        self.connections.write().await.insert(connection_id, tx.clone());

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if !sink.send(text).await {
                    break;
                }
            }
        });

        let established = ServerFrame::ConnectionEstablished {
            connection_id,
        };
        self.send_frame(connection_id, &established).await;

        // The reader coroutine is the sole owner and sole mutator of this
        // set for the lifetime of the connection; no lock guards it.
        let mut membership: HashSet<String> = HashSet::new();

        loop {
            let Some(text) = source.recv().await else {
                break;
            };

            let frame: ClientFrame = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, connection_id = %connection_id, "dropping unparseable client frame");
                    continue;
                }
            };

            self.handle_frame(connection_id, frame, &mut membership).await;
        }

        self.cleanup(connection_id, membership).await;
    }

    async fn handle_frame(
        &self,
        connection_id: Uuid,
        frame: ClientFrame,
        membership: &mut HashSet<String>,
    ) {
        match frame.action {
            ClientAction::Subscribe => {
                if let Some(channel) = frame.channel {
                    if self.subscribe(connection_id, &channel).await {
                        membership.insert(channel);
                    }
                }
            }
            ClientAction::Unsubscribe => {
                if let Some(channel) = frame.channel {
                    membership.remove(&channel);
                    self.unsubscribe(connection_id, &channel).await;
                }
            }
            ClientAction::Catchup => {
                if let Some(channel) = frame.channel {
                    let since_id = frame.last_event_id.unwrap_or(0);
                    self.run_catchup(connection_id, &channel, since_id).await;
                }
            }
            ClientAction::Ping => {
                self.send_frame(connection_id, &ServerFrame::Pong).await;
            }
        }
    }

    /// Returns `true` if the subscription succeeded and the caller should add
    /// `channel` to its own membership set.
    #[instrument(skip(self))]
    async fn subscribe(&self, connection_id: Uuid, channel: &str) -> bool {
        let first_subscriber = {
            let mut channels = self.channels.write().await;
            let set = channels.entry(channel.to_string()).or_insert_with(HashSet::new);
            let was_empty = set.is_empty();
            set.insert(connection_id);
            was_empty
        };

        if first_subscriber {
            match self.listener.listen(channel).await {
                Ok(()) => {}
                Err(err) => {
                    self.cleanup_orphans(channel, &err.to_string()).await;
                    return false;
                }
            }
        }

        self.send_frame(
            connection_id,
            &ServerFrame::SubscriptionConfirmed {
                channel: channel.to_string(),
            },
        )
        .await;
        self.run_catchup(connection_id, channel, 0).await;
        true
    }

    /// Between the registry insert and a failed LISTEN, other connections may
    /// have observed "already exists", skipped requesting LISTEN, and
    /// received `subscription.confirmed`; they are now orphaned. Deletes the
    /// channel entry entirely and notifies every affected connection.
    async fn cleanup_orphans(&self, channel: &str, message: &str) {
        let orphans: Vec<Uuid> = {
            let mut channels = self.channels.write().await;
            channels
                .remove(channel)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };

        for connection_id in orphans {
            self.send_frame(
                connection_id,
                &ServerFrame::SubscriptionError {
                    channel: channel.to_string(),
                    message: message.to_string(),
                },
            )
            .await;
        }
    }

    #[instrument(skip(self))]
    async fn unsubscribe(&self, connection_id: Uuid, channel: &str) {
        let now_empty = {
            let mut channels = self.channels.write().await;
            match channels.get_mut(channel) {
                Some(set) => {
                    set.remove(&connection_id);
                    let empty = set.is_empty();
                    if empty {
                        channels.remove(channel);
                    }
                    empty
                }
                None => false,
            }
        };

        if !now_empty {
            return;
        }

        let listener = self.listener.clone();
        let channels = self.channels.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            // Re-check the registry first: a new subscriber may have raced in
            // since the empty-check above; abort if so.
            let still_empty = { !channels.read().await.contains_key(&channel) };
            if still_empty {
                listener.unlisten_detached(&channel).await;
            }
        });
    }

    #[instrument(skip(self))]
    async fn run_catchup(&self, connection_id: Uuid, channel: &str, since_id: i64) {
        let result = match self
            .catchup
            .get_catchup_events(channel, since_id, self.catchup_max)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(%err, channel, "catchup query failed");
                return;
            }
        };

        for event in result.events {
            self.send_raw(connection_id, event.payload).await;
        }

        if result.overflowed {
            self.send_frame(
                connection_id,
                &ServerFrame::CatchupOverflow {
                    channel: channel.to_string(),
                    has_more: true,
                },
            )
            .await;
        }
    }

    async fn cleanup(&self, connection_id: Uuid, membership: HashSet<String>) {
        self.connections.write().await.remove(&connection_id);
        for channel in membership {
            self.unsubscribe(connection_id, &channel).await;
        }
        debug!(connection_id = %connection_id, "connection cleaned up");
    }

    async fn send_frame(&self, connection_id: Uuid, frame: &ServerFrame) {
        match frame.to_json() {
            Ok(text) => self.send_text(connection_id, text).await,
            Err(err) => error!(%err, "failed to serialize server frame"),
        }
    }

    async fn send_raw(&self, connection_id: Uuid, payload: Value) {
        match serde_json::to_string(&payload) {
            Ok(text) => self.send_text(connection_id, text).await,
            Err(err) => error!(%err, "failed to serialize event payload"),
        }
    }

    async fn send_text(&self, connection_id: Uuid, text: String) {
        let sender = { self.connections.read().await.get(&connection_id).cloned() };
        if let Some(sender) = sender {
            if let Err(err) = sender.send_timeout(text, self.write_timeout).await {
                warn!(%err, connection_id = %connection_id, "bounded write to client failed");
            }
        }
    }
}

impl NotificationSink for ConnectionManager {
    /// Resolves the channel's subscriber set and their senders under their
    /// respective locks, releases both, then performs a bounded-timeout write
    /// to each; no lock is held across a socket write.
    fn dispatch(&self, channel: &str, payload: &str) {
        let channel = channel.to_string();
        let payload = payload.to_string();
        let channels = self.channels.clone();
        let connections = self.connections.clone();
        let write_timeout = self.write_timeout;

        tokio::spawn(async move {
            let ids: Vec<Uuid> = {
                let channels = channels.read().await;
                match channels.get(&channel) {
                    Some(set) => set.iter().copied().collect(),
                    None => return,
                }
            };

            let senders: Vec<mpsc::Sender<String>> = {
                let connections = connections.read().await;
                ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
            };

            for sender in senders {
                if let Err(err) = sender.send_timeout(payload.clone(), write_timeout).await {
                    warn!(%err, channel, "fan-out write failed for one client");
                }
            }
        });
    }
}

//! Notify Listener: the single coroutine permitted to issue statements on the
//! dedicated LISTEN connection, and the command-queue/generation-counter
//! design that makes concurrent subscribe/unsubscribe safe (§4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use session_events_common::{CoreError, ListenerConfig, Result};

/// Where the receive loop hands off notifications it pulls off the wire.
/// Implemented by the Connection Manager; injected after construction to
/// break the Listener <-> Manager cycle (§9 design notes).
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, channel: &str, payload: &str);
}

enum Command {
    Listen {
        channel: String,
        respond: oneshot::Sender<Result<()>>,
    },
    Unlisten {
        channel: String,
        captured_generation: u64,
        respond: oneshot::Sender<Result<()>>,
    },
}

/// Per-channel generation counters, shared with callers so an unsubscribe can
/// capture the generation at enqueue time without asking the receive loop.
type GenerationMap = Arc<Mutex<HashMap<String, u64>>>;

/// A cheaply-cloneable handle used by the Connection Manager to submit
/// subscribe/unsubscribe requests. The receive loop itself is not
/// accessible from here; only through the command queue.
#[derive(Clone)]
pub struct NotifyListenerHandle {
    cmd_tx: mpsc::Sender<Command>,
    generations: GenerationMap,
    running: Arc<AtomicBool>,
    listen_timeout: Duration,
}

impl NotifyListenerHandle {
    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::ListenerStopped)
        }
    }

    /// Enqueues a LISTEN and waits (bounded) for it to execute. Always
    /// enqueues even if the caller believes the channel is already listening:
    /// the database treats duplicate LISTENs as idempotent, and this closes
    /// the window where a racing UNLISTEN would otherwise leave the channel
    /// unlistened.
    #[instrument(skip(self))]
    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.ensure_running()?;
        let (respond, recv) = oneshot::channel();
        self.cmd_tx
            .send(Command::Listen {
                channel: channel.to_string(),
                respond,
            })
            .await
            .map_err(|_| CoreError::CommandChannelClosed)?;

        match tokio::time::timeout(self.listen_timeout, recv).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::CommandChannelClosed),
            Err(_) => Err(CoreError::ListenTimeout(channel.to_string())),
        }
    }

    /// Captures the channel's current generation, then enqueues an UNLISTEN.
    /// Does not wait for the result: unsubscribe is fire-and-forget from a
    /// detached coroutine per §4.4.
    #[instrument(skip(self))]
    pub async fn unlisten_detached(&self, channel: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let captured_generation = {
            let generations = self.generations.lock().await;
            *generations.get(channel).unwrap_or(&0)
        };
        let (respond, _recv) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Unlisten {
                channel: channel.to_string(),
                captured_generation,
                respond,
            })
            .await
            .is_err()
        {
            warn!(channel, "command channel closed while scheduling UNLISTEN");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Owns the dedicated connection. Only the task spawned by [`spawn`] ever
/// issues a statement on it.
pub struct NotifyListener {
    pool: PgPool,
    config: ListenerConfig,
    sink: Arc<dyn NotificationSink>,
    cmd_rx: mpsc::Receiver<Command>,
    generations: GenerationMap,
    running: Arc<AtomicBool>,
    /// channel -> currently LISTENing, loop-local per §3: no other coroutine
    /// reads or writes this map.
    listen_state: HashMap<String, bool>,
}

/// Spawns the receive-loop task and returns a handle plus its join handle.
pub fn spawn(
    pool: PgPool,
    config: ListenerConfig,
    sink: Arc<dyn NotificationSink>,
) -> (NotifyListenerHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let generations = Arc::new(Mutex::new(HashMap::new()));
    let running = Arc::new(AtomicBool::new(true));

    let handle = NotifyListenerHandle {
        cmd_tx,
        generations: generations.clone(),
        running: running.clone(),
        listen_timeout: Duration::from_secs(config.listen_timeout_secs),
    };

    let listener = NotifyListener {
        pool,
        config,
        sink,
        cmd_rx,
        generations,
        running,
        listen_state: HashMap::new(),
    };

    let join = tokio::spawn(listener.run());
    (handle, join)
}

impl NotifyListener {
    async fn run(mut self) {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(%err, "initial connection to dedicated listen connection failed");
                return;
            }
        };

        loop {
            if !self.running.load(Ordering::SeqCst) {
                info!("notify listener shutting down");
                break;
            }

            self.drain_commands(&mut conn).await;

            let poll = Duration::from_millis(self.config.poll_interval_ms);
            match tokio::time::timeout(poll, conn.recv()).await {
                Ok(Ok(notification)) => {
                    let channel = notification.channel().to_string();
                    let payload = notification.payload().to_string();
                    debug!(channel = %channel, "dispatching notification");
                    self.sink.dispatch(&channel, &payload);
                }
                Ok(Err(err)) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(%err, "notify listener receive error, reconnecting");
                    match self.reconnect().await {
                        Ok(new_conn) => conn = new_conn,
                        Err(err) => {
                            error!(%err, "failed to reconnect dedicated listen connection");
                            break;
                        }
                    }
                }
                Err(_timeout) => {
                    // Bounded poll elapsed with nothing to receive; loop back
                    // to draining commands.
                }
            }
        }

        let _ = conn.unlisten_all().await;
    }

    async fn connect(&self) -> Result<PgListener> {
        Ok(PgListener::connect_with(&self.pool).await?)
    }

    async fn drain_commands(&mut self, conn: &mut PgListener) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Listen { channel, respond } => {
                    let result = self.process_listen(conn, &channel).await;
                    let _ = respond.send(result);
                }
                Command::Unlisten {
                    channel,
                    captured_generation,
                    respond,
                } => {
                    let result = self
                        .process_unlisten(conn, &channel, captured_generation)
                        .await;
                    let _ = respond.send(result);
                }
            }
        }
    }

    /// Executes LISTEN unconditionally, then bumps the channel's generation.
    async fn process_listen(&mut self, conn: &mut PgListener, channel: &str) -> Result<()> {
        conn.listen(channel).await?;
        self.listen_state.insert(channel.to_string(), true);
        let mut generations = self.generations.lock().await;
        let gen = generations.entry(channel.to_string()).or_insert(0);
        *gen += 1;
        debug!(channel, generation = *gen, "LISTEN executed");
        Ok(())
    }

    /// Skips the UNLISTEN if the channel's generation has advanced since it
    /// was captured: a newer LISTEN raced ahead of this UNLISTEN and must
    /// not be cancelled (the crux of §4.3).
    async fn process_unlisten(
        &mut self,
        conn: &mut PgListener,
        channel: &str,
        captured_generation: u64,
    ) -> Result<()> {
        let current_generation = {
            let generations = self.generations.lock().await;
            *generations.get(channel).unwrap_or(&0)
        };

        if current_generation != captured_generation {
            debug!(
                channel,
                captured_generation, current_generation, "stale UNLISTEN skipped"
            );
            return Ok(());
        }

        conn.unlisten(channel).await?;
        // Only clear listen-state if the generation still has not advanced:
        // a LISTEN may have slipped in between the check above and here.
        let generations = self.generations.lock().await;
        if *generations.get(channel).unwrap_or(&0) == captured_generation {
            self.listen_state.remove(channel);
        }
        debug!(channel, "UNLISTEN executed");
        Ok(())
    }

    /// Closes the old connection, dials with exponential backoff capped at
    /// `reconnect_backoff_cap_secs`, then re-issues LISTEN for every channel
    /// still in the listen-state map. Per-channel failures are logged, not
    /// fatal; the loop continues with whichever channels succeeded.
    async fn reconnect(&mut self) -> Result<PgListener> {
        let initial = Duration::from_millis(self.config.reconnect_backoff_initial_ms);
        let cap = Duration::from_secs(self.config.reconnect_backoff_cap_secs);
        let mut backoff = initial;

        let mut conn = loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(CoreError::ListenerStopped);
            }
            match self.connect().await {
                Ok(conn) => break conn,
                Err(err) => {
                    warn!(%err, backoff_ms = backoff.as_millis() as u64, "reconnect attempt failed");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, cap);
                }
            }
        };

        let channels: Vec<String> = self.listen_state.keys().cloned().collect();
        for channel in channels {
            if let Err(err) = conn.listen(&channel).await {
                error!(channel, %err, "failed to re-LISTEN after reconnect");
                continue;
            }
            let mut generations = self.generations.lock().await;
            let gen = generations.entry(channel.clone()).or_insert(0);
            *gen += 1;
        }

        info!("dedicated listen connection reestablished");
        Ok(conn)
    }
}

/// Signals shutdown: blocks new subscribe/unsubscribe submissions. The
/// receive loop observes the flag on its next iteration, closes the
/// connection, and exits; join the returned `JoinHandle` to wait for it.
pub fn shutdown(handle: &NotifyListenerHandle) {
    handle.running.store(false, Ordering::SeqCst);
}

/// Quotes a channel name as a Postgres identifier (double-quote, doubling any
/// embedded quotes). `sqlx::PgListener::listen`/`unlisten` already do this
/// internally; this mirrors that behavior for our own diagnostic SQL and is
/// exercised directly in tests as the contract §6 calls out explicitly.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_wraps_plain_name() {
        assert_eq!(quote_ident("sessions"), "\"sessions\"");
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }
}

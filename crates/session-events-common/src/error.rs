use thiserror::Error;
use uuid::Uuid;

/// Error currency shared across the event distribution core.
///
/// Mirrors the component boundaries from the design's error taxonomy:
/// database failures surface from the shared pool or the dedicated listen
/// connection, listener-lifecycle errors come from the command-queue
/// protocol, and connection errors come from the per-client registry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("notify listener is not running")]
    ListenerStopped,

    #[error("timed out waiting for LISTEN on channel {0:?}")]
    ListenTimeout(String),

    #[error("listener command channel closed")]
    CommandChannelClosed,

    #[error("connection not found: {0}")]
    ConnectionNotFound(Uuid),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

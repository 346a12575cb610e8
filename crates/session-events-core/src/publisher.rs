//! Transactional publish: persist (optional) + notify (§4.2).

use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{error, instrument, warn};

use session_events_common::Result;

use crate::event_store::EventStore;

/// Conservative margin under Postgres's 8000-byte NOTIFY payload limit.
pub const NOTIFY_PAYLOAD_BUDGET: usize = 7_900;

#[derive(Clone)]
pub struct Publisher {
    pool: PgPool,
    store: EventStore,
}

impl Publisher {
    pub fn new(pool: PgPool) -> Self {
        let store = EventStore::new(pool.clone());
        Self { pool, store }
    }

    /// Inserts the event under a transaction and emits a `pg_notify` within the
    /// same transaction, so the notification only fires on commit.
    #[instrument(skip(self, payload))]
    pub async fn publish_persistent(
        &self,
        session_id: &str,
        channel: &str,
        mut payload: Value,
    ) -> Result<i64> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let id = self
            .store
            .insert(&mut *tx, session_id, channel, &payload)
            .await?;

        stamp_db_event_id(&mut payload, id);

        let notify_payload = truncate_if_oversized(&payload)?;
        notify(&mut *tx, channel, &notify_payload).await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Emits a notification with no database row. High-frequency streaming
    /// deltas take this path.
    #[instrument(skip(self, payload))]
    pub async fn publish_transient(&self, channel: &str, payload: Value) -> Result<()> {
        let notify_payload = truncate_if_oversized(&payload)?;
        notify(&self.pool, channel, &notify_payload).await?;
        Ok(())
    }

    /// Fire-and-forget wrapper: logs and swallows the error instead of
    /// surfacing it to call sites that can't handle a publish failure inline.
    pub async fn publish_persistent_detached(&self, session_id: &str, channel: &str, payload: Value) {
        if let Err(err) = self.publish_persistent(session_id, channel, payload).await {
            error!(%channel, %err, "detached publish_persistent failed");
        }
    }

    pub async fn publish_transient_detached(&self, channel: &str, payload: Value) {
        if let Err(err) = self.publish_transient(channel, payload).await {
            error!(%channel, %err, "detached publish_transient failed");
        }
    }
}

fn stamp_db_event_id(payload: &mut Value, id: i64) {
    if let Value::Object(map) = payload {
        map.insert("db_event_id".to_string(), json!(id));
    }
}

/// Truncates the payload to the identifier fields plus `truncated: true` if its
/// serialized form exceeds [`NOTIFY_PAYLOAD_BUDGET`] bytes. The boundary is
/// exclusive: exactly `NOTIFY_PAYLOAD_BUDGET` bytes is not truncated.
fn truncate_if_oversized(payload: &Value) -> Result<String> {
    let serialized = serde_json::to_string(payload)?;
    if serialized.len() <= NOTIFY_PAYLOAD_BUDGET {
        return Ok(serialized);
    }

    warn!(
        size = serialized.len(),
        budget = NOTIFY_PAYLOAD_BUDGET,
        "notify payload exceeds budget, truncating to identifiers"
    );

    let mut stub = json!({"truncated": true});
    if let Value::Object(stub_map) = &mut stub {
        if let Value::Object(src) = payload {
            for key in ["type", "event_id", "session_id", "db_event_id"] {
                if let Some(v) = src.get(key) {
                    stub_map.insert(key.to_string(), v.clone());
                }
            }
        }
    }
    Ok(serde_json::to_string(&stub)?)
}

async fn notify<'e, E>(executor: E, channel: &str, payload: &str) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(executor)
        .await?;
    Ok(())
}

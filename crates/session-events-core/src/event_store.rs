//! Append-only store of persistent events, keyed by a monotone integer id (§4.1).

use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use session_events_common::Result;

/// One row of the `events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub session_id: String,
    pub channel: String,
    pub payload: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a new row and returns its generated id. Used by the Publisher
    /// inside its own transaction; takes an executor so the insert and the
    /// notify happen on the same transaction.
    #[instrument(skip(self, executor, payload))]
    pub async fn insert<'a, E>(
        &self,
        executor: E,
        session_id: &str,
        channel: &str,
        payload: &Value,
    ) -> Result<i64>
    where
        E: sqlx::PgExecutor<'a>,
    {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO events (session_id, channel, payload) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(session_id)
        .bind(channel)
        .bind(payload)
        .fetch_one(executor)
        .await?;
        Ok(row.0)
    }

    /// Rows with `id > since_id` and `channel = channel`, ordered by `id` ascending, capped at `limit`.
    #[instrument(skip(self))]
    pub async fn events_since(
        &self,
        channel: &str,
        since_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(
            "SELECT id, session_id, channel, payload, created_at FROM events \
             WHERE channel = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
        )
        .bind(channel)
        .bind(since_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: i64) -> StoredEvent {
        StoredEvent {
            id,
            session_id: "s".to_string(),
            channel: "sessions".to_string(),
            payload: serde_json::json!({"id": id}),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn stored_event_carries_its_own_id() {
        let e = event(7);
        assert_eq!(e.id, 7);
    }
}

//! Catch-up Querier: reads a bounded window of past events on subscribe and
//! on explicit client request (§4.5).

use serde_json::Value;
use tracing::instrument;

use session_events_common::Result;

use crate::event_store::EventStore;

/// An event ready to be streamed to a client, with `db_event_id` stamped onto
/// its payload at delivery time (storage stamps it at publish-time via the
/// notify path; catch-up stamps it here for parity).
#[derive(Debug, Clone)]
pub struct CatchupEvent {
    pub channel: String,
    pub payload: Value,
}

/// Result of a catch-up read: the events to deliver, and whether the window
/// was truncated (more events exist beyond `limit`).
#[derive(Debug)]
pub struct CatchupResult {
    pub events: Vec<CatchupEvent>,
    pub overflowed: bool,
}

#[derive(Clone)]
pub struct CatchupQuerier {
    store: EventStore,
}

impl CatchupQuerier {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Queries `limit + 1` rows to detect overflow: if more than `limit` rows
    /// come back, the result is truncated to `limit` and `overflowed` is set.
    #[instrument(skip(self))]
    pub async fn get_catchup_events(
        &self,
        channel: &str,
        since_id: i64,
        limit: i64,
    ) -> Result<CatchupResult> {
        let mut rows = self.store.events_since(channel, since_id, limit + 1).await?;

        let overflowed = rows.len() as i64 > limit;
        if overflowed {
            rows.truncate(limit as usize);
        }

        let events = rows
            .into_iter()
            .map(|row| {
                let mut payload = row.payload;
                if let Value::Object(map) = &mut payload {
                    map.insert("db_event_id".to_string(), serde_json::json!(row.id));
                }
                CatchupEvent {
                    channel: row.channel,
                    payload,
                }
            })
            .collect();

        Ok(CatchupResult { events, overflowed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catchup_result_not_overflowed_when_under_limit() {
        let result = CatchupResult {
            events: vec![],
            overflowed: false,
        };
        assert!(!result.overflowed);
    }
}

//! Wire types for the client <-> Connection Manager frame protocol (§6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A frame sent by a client over the WebSocket connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub action: ClientAction,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub last_event_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Catchup,
    Ping,
}

/// A control frame sent by the server. Domain event payloads are forwarded
/// verbatim as raw JSON and are not represented by this enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connection.established")]
    ConnectionEstablished { connection_id: Uuid },

    #[serde(rename = "subscription.confirmed")]
    SubscriptionConfirmed { channel: String },

    #[serde(rename = "subscription.error")]
    SubscriptionError { channel: String, message: String },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "catchup.overflow")]
    CatchupOverflow { channel: String, has_more: bool },
}

impl ServerFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

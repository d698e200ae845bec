//! Client protocol: inbound message shape, roles and outbound fan-out.
//!
//! DESIGN
//! ======
//! Clients send one JSON object per websocket message and may batch several
//! keys in it. The object is decoded exactly once into [`ClientMessage`];
//! connection-level keys sit at the top, everything a table handles lives in
//! the flattened [`TableRequest`], and the reversible actions inside that are
//! the flattened [`RawAction`].
//!
//! Outbound messages are serialized once and shared as `Arc<str>` between
//! every recipient's bounded outbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::services::action::RawAction;
use crate::services::content::ObjId;

pub type UserId = u64;

/// Pre-serialized outbound message.
pub type Outbound = Arc<str>;

/// Sending half of a connection's outbox.
pub type Outbox = mpsc::Sender<Outbound>;

/// Serialize a message once for fan-out.
#[must_use]
pub fn encode(message: &Value) -> Outbound {
    Arc::from(message.to_string())
}

// =============================================================================
// ROLES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Player,
    Spectator,
}

impl Role {
    /// Parse a role name as returned by the authorization collaborator.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "owner" => Some(Self::Owner),
            "player" => Some(Self::Player),
            "spectator" => Some(Self::Spectator),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Owner => 1,
            Self::Player => 2,
            Self::Spectator => 3,
        }
    }

    /// Owners and players may change the game state.
    #[must_use]
    pub fn can_play(self) -> bool {
        matches!(self, Self::Owner | Self::Player)
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

// =============================================================================
// INBOUND
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeTable {
    pub id: String,
    #[serde(default)]
    pub role_request: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MousePos {
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    #[serde(default)]
    pub mouse_pos: Option<MousePos>,
    #[serde(default)]
    pub grab: Option<Vec<ObjId>>,
    #[serde(default)]
    pub drop: Option<Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatusEntry {
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatText {
    pub content: String,
}

/// Keys handled by the table a connection is bound to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRequest {
    #[serde(default)]
    pub promote_user: Option<UserId>,
    #[serde(default)]
    pub demote_user: Option<UserId>,
    #[serde(default)]
    pub reveal_objs: Option<Vec<ObjId>>,
    #[serde(default)]
    pub hint: Option<Hint>,
    #[serde(default)]
    pub emote: Option<Value>,
    #[serde(default)]
    pub undo: Option<Value>,
    #[serde(default)]
    pub redo: Option<Value>,
    #[serde(default)]
    pub update_status: Option<Vec<StatusEntry>>,
    #[serde(default)]
    pub text: Option<ChatText>,
    #[serde(flatten)]
    pub action: RawAction,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub monitor: Option<Value>,
    #[serde(default)]
    pub subscribe: Option<Value>,
    #[serde(default)]
    pub subscribe_table: Option<SubscribeTable>,
    /// Round-trip delay samples in ms.
    #[serde(default)]
    pub delays: Option<Vec<f64>>,
    /// Opaque token echoed back once the message has been handled.
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(flatten)]
    pub table: TableRequest,
}

// =============================================================================
// AUDIENCE
// =============================================================================

/// A set of connections that receive the same broadcasts (table list
/// subscribers, stats monitors).
#[derive(Clone, Default)]
pub struct Audience {
    members: Arc<Mutex<HashMap<UserId, Outbox>>>,
}

impl Audience {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: UserId, outbox: Outbox) {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).insert(user_id, outbox);
    }

    pub fn remove(&self, user_id: UserId) {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).remove(&user_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort send to every member.
    pub fn publish(&self, message: &Value) {
        let members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        if members.is_empty() {
            return;
        }
        let encoded = encode(message);
        for (user_id, outbox) in members.iter() {
            if outbox.try_send(encoded.clone()).is_err() {
                warn!(%user_id, "audience outbox full or closed; dropping message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batched_message_decodes_every_layer() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "request": 7,
            "undo": 1,
            "hint": {"drop": true},
            "flipObjs": [2],
            "subscribeTable": {"id": "abc", "roleRequest": "player"},
        }))
        .unwrap();
        assert_eq!(msg.request, Some(json!(7)));
        assert_eq!(msg.subscribe_table.unwrap().role_request.as_deref(), Some("player"));
        assert!(msg.table.undo.is_some());
        assert!(msg.table.hint.unwrap().drop.is_some());
        assert_eq!(msg.table.action.flip_objs, Some(vec![2]));
    }

    #[test]
    fn roles_travel_as_numbers() {
        assert_eq!(serde_json::to_value(Role::Owner).unwrap(), json!(1));
        assert_eq!(serde_json::to_value(Role::Spectator).unwrap(), json!(3));
        assert_eq!(Role::from_name("player"), Some(Role::Player));
        assert_eq!(Role::from_name("admin"), None);
        assert!(!Role::Spectator.can_play());
    }

    #[tokio::test]
    async fn audience_publishes_to_members_until_removed() {
        let audience = Audience::new();
        let (tx, mut rx) = mpsc::channel(4);
        audience.insert(1, tx);
        audience.publish(&json!({"addTable": {"id": "t"}}));
        assert_eq!(&*rx.recv().await.unwrap(), r#"{"addTable":{"id":"t"}}"#);

        audience.remove(1);
        assert!(audience.is_empty());
        audience.publish(&json!({"removeTable": {"id": "t"}}));
        assert!(rx.try_recv().is_err());
    }
}

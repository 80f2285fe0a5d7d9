use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{count, id_string, optional_id};
use crate::sync::Keyed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Keyed for ChatRoom {
    fn key(&self) -> &str {
        &self.id
    }

    /// Rooms sort by latest activity; a room without messages sorts by creation.
    fn sort_at(&self) -> DateTime<Utc> {
        self.last_message_at
            .or(self.created_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Membership of one profile in one room. `unread_count` is owned by the
/// backend and only read here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatParticipant {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub chat_room_id: String,
    #[serde(deserialize_with = "id_string")]
    pub profile_id: String,
    #[serde(default, deserialize_with = "count")]
    pub unread_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub chat_room_id: String,
    #[serde(deserialize_with = "id_string")]
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Keyed for Message {
    fn key(&self) -> &str {
        &self.id
    }

    fn sort_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

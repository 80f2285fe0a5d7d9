use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProfileSummary, id_string, optional_id};
use crate::sync::Keyed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    Mention,
    #[serde(other)]
    Other,
}

/// Post columns embedded in a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, deserialize_with = "optional_id")]
    pub actor_id: Option<String>,
    #[serde(default, deserialize_with = "optional_id")]
    pub post_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub actor: Option<ProfileSummary>,
    #[serde(default)]
    pub post: Option<PostSummary>,
}

impl Keyed for Notification {
    fn key(&self) -> &str {
        &self.id
    }

    fn sort_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.actor.is_none() && self.actor_id == previous.actor_id {
            self.actor = previous.actor.clone();
        }
        if self.post.is_none() && self.post_id == previous.post_id {
            self.post = previous.post.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_embedded_actor_and_unknown_kinds() {
        let row = json!({
            "id": 9,
            "user_id": "u1",
            "type": "like",
            "actor_id": "u2",
            "post_id": 3,
            "read": false,
            "created_at": "2024-05-01T10:00:00.123456+00:00",
            "actor": { "id": "u2", "username": "grace", "full_name": null },
            "post": null
        });
        let notification: Notification = serde_json::from_value(row).unwrap();
        assert_eq!(notification.id, "9");
        assert_eq!(notification.kind, NotificationKind::Like);
        assert_eq!(notification.post_id.as_deref(), Some("3"));
        assert_eq!(
            notification.actor.and_then(|actor| actor.username).as_deref(),
            Some("grace")
        );

        let other: NotificationKind = serde_json::from_value(json!("repost")).unwrap();
        assert_eq!(other, NotificationKind::Other);
    }
}

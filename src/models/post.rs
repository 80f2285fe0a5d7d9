use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{count, id_string, optional_id};
use crate::models::ProfileSummary;
use crate::sync::Keyed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, alias = "likes", deserialize_with = "count")]
    pub likes_count: i64,
    #[serde(default, alias = "comments", deserialize_with = "count")]
    pub comments_count: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<ProfileSummary>,
}

impl Keyed for Post {
    fn key(&self) -> &str {
        &self.id
    }

    fn sort_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn revision(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.author.is_none() && self.user_id == previous.user_id {
            self.author = previous.author.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub post_id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
}

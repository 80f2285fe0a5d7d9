//! List fetching, realtime merge and cursor pagination shared by every screen.

use chrono::{DateTime, Utc};

pub mod cursor;
pub mod in_flight;
pub mod live_list;
pub mod synced_list;

pub use cursor::{Cursor, ListQuery};
pub use in_flight::{InFlightGuard, InFlightKeys};
pub use live_list::LiveList;
pub use synced_list::{ChannelStatus, SyncedList};

/// A row with a primary key and a position in time.
pub trait Keyed: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;

    fn sort_at(&self) -> DateTime<Utc>;

    /// Last-modified marker; a merge never replaces a row with an older one.
    fn revision(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Called before this row replaces `previous`. Realtime images carry only
    /// the table's own columns, so embedded relations are taken from the held
    /// row when this one lacks them.
    fn carry_over(&mut self, _previous: &Self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

/// What a screen shows for a list. Every load ends in a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Ready,
    /// Loaded with no rows; the screen shows its empty state.
    Empty,
    Failed(String),
}

impl LoadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadState::Loading)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    pub(crate) struct Note {
        pub id: String,
        pub created_at: DateTime<Utc>,
        #[serde(default)]
        pub body: String,
        #[serde(default)]
        pub updated_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub author: Option<String>,
    }

    impl Keyed for Note {
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
            if self.author.is_none() {
                self.author = previous.author.clone();
            }
        }
    }

    pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_557_600 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    pub(crate) fn note(id: &str, seconds: i64, body: &str) -> Note {
        Note {
            id: id.to_string(),
            created_at: at(seconds),
            body: body.to_string(),
            updated_at: None,
            author: None,
        }
    }
}

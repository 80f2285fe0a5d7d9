use chrono::{DateTime, SecondsFormat, Utc};

use super::Keyed;
use crate::backend::{Filter, Select};

/// Position of the last row of a fetched page: its sort timestamp with the
/// primary key as tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub sort_at: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn of<T: Keyed>(item: &T) -> Self {
        Self {
            sort_at: item.sort_at(),
            id: item.key().to_string(),
        }
    }

    /// Rows strictly older than the cursor in `(column, id)` order.
    pub fn older_than(&self, column: &str) -> Filter {
        let at = self.sort_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        Filter::Or(vec![
            Filter::lt(column, at.clone()),
            Filter::And(vec![
                Filter::eq(column, at),
                Filter::lt("id", self.id.clone()),
            ]),
        ])
    }
}

/// How a list is read from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    base: Select,
    sort_column: String,
    page_size: Option<usize>,
}

impl ListQuery {
    /// Newest-first pages of `page_size` rows, continued by cursor.
    pub fn paged(base: Select, sort_column: &str, page_size: usize) -> Self {
        assert!(page_size > 0, "Page size must be positive");
        assert!(
            base.order.is_empty() && base.limit.is_none(),
            "Paged queries own their ordering and range"
        );
        Self {
            base,
            sort_column: sort_column.to_string(),
            page_size: Some(page_size),
        }
    }

    /// A single newest-first read of every matching row.
    pub fn unpaged(base: Select, sort_column: &str) -> Self {
        Self {
            base,
            sort_column: sort_column.to_string(),
            page_size: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.base.table
    }

    pub fn page_size(&self) -> Option<usize> {
        self.page_size
    }

    pub fn first_page(&self) -> Select {
        let query = self
            .base
            .clone()
            .order(&self.sort_column, false)
            .order("id", false);
        match self.page_size {
            Some(size) => query.limit(size),
            None => query,
        }
    }

    pub fn page_after(&self, cursor: &Cursor) -> Select {
        self.first_page().filter(cursor.older_than(&self.sort_column))
    }

    /// A full page means more rows may follow.
    pub fn has_more_after(&self, fetched: usize) -> bool {
        self.page_size.is_some_and(|size| fetched >= size)
    }
}

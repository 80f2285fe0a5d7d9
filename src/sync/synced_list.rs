use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Cursor, Keyed, ListQuery, LiveList, LoadState, SortOrder};
use crate::alerts::{Alert, AlertSink};
use crate::backend::{Backend, ChangeEvent, ChangeKind, ChannelEvent, ChannelSpec, Row, decode_row, decode_rows};
use crate::error::{SyncError, SyncResult};
use crate::scope::ScreenScope;

/// Health of the realtime channel feeding a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Detached,
    Joining,
    Live,
    Errored(String),
    Closed,
}

struct ListState<T: Keyed> {
    list: LiveList<T>,
    load_state: LoadState,
    cursor: Option<Cursor>,
    has_more: bool,
    channel: ChannelStatus,
}

struct Shared<T: Keyed> {
    table: String,
    query: Mutex<ListQuery>,
    state: Mutex<ListState<T>>,
    revision: watch::Sender<u64>,
}

impl<T: Keyed + DeserializeOwned> Shared<T> {
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn apply_change(&self, change: &ChangeEvent) -> bool {
        let changed = match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = change.new.clone() else {
                    warn!("{:?} on {} carried no row", change.kind, self.table);
                    return false;
                };
                let item: T = match decode_row(&self.table, row) {
                    Ok(item) => item,
                    Err(err) => {
                        warn!("Dropping realtime change: {err}");
                        return false;
                    }
                };
                let mut state = self.state.lock();
                let changed = if change.kind == ChangeKind::Insert {
                    state.list.upsert(item)
                } else {
                    state.list.update(item)
                };
                if changed && state.load_state == LoadState::Empty {
                    state.load_state = LoadState::Ready;
                }
                changed
            }
            ChangeKind::Delete => {
                let Some(key) = change.key() else {
                    warn!("DELETE on {} carried no primary key", self.table);
                    return false;
                };
                let mut state = self.state.lock();
                let removed = state.list.remove(&key).is_some();
                if removed && state.list.is_empty() && state.load_state == LoadState::Ready {
                    state.load_state = LoadState::Empty;
                }
                removed
            }
        };
        if changed {
            debug!("Applied {} on {}", change.kind.as_str(), self.table);
            self.bump();
        }
        changed
    }

    fn set_channel(&self, status: ChannelStatus) {
        self.state.lock().channel = status;
        self.bump();
    }

    /// Applies one channel event. Returns `false` once the channel is closed.
    fn handle(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Subscribed => {
                debug!("Realtime joined for {}", self.table);
                self.set_channel(ChannelStatus::Live);
            }
            ChannelEvent::Change(change) => {
                self.apply_change(&change);
            }
            ChannelEvent::Error(message) => {
                warn!("Realtime channel for {} errored: {message}", self.table);
                self.set_channel(ChannelStatus::Errored(message));
            }
            ChannelEvent::Closed => {
                debug!("Realtime channel for {} closed", self.table);
                self.set_channel(ChannelStatus::Closed);
                return false;
            }
        }
        true
    }
}

/// A list kept in step with the backend: fetched by page, extended by
/// cursor, patched by realtime deltas, and bound to one screen's scope.
pub struct SyncedList<T: Keyed> {
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    scope: Arc<ScreenScope>,
    load_timeout: Duration,
    shared: Arc<Shared<T>>,
    loading_more: Arc<AtomicBool>,
}

impl<T: Keyed> Clone for SyncedList<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            alerts: Arc::clone(&self.alerts),
            scope: Arc::clone(&self.scope),
            load_timeout: self.load_timeout,
            shared: Arc::clone(&self.shared),
            loading_more: Arc::clone(&self.loading_more),
        }
    }
}

/// Clears the single-flight flag even when the load is cancelled mid-way.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Keyed + DeserializeOwned> SyncedList<T> {
    pub fn new(
        backend: Arc<dyn Backend>,
        alerts: Arc<dyn AlertSink>,
        scope: Arc<ScreenScope>,
        query: ListQuery,
        order: SortOrder,
        load_timeout: Duration,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            table: query.table().to_string(),
            state: Mutex::new(ListState {
                list: LiveList::new(order),
                load_state: LoadState::Loading,
                cursor: None,
                has_more: query.page_size().is_some(),
                channel: ChannelStatus::Detached,
            }),
            query: Mutex::new(query),
            revision,
        });
        Self {
            backend,
            alerts,
            scope,
            load_timeout,
            shared,
            loading_more: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    /// Swaps the query the list is read with, e.g. when the set of rooms a
    /// user belongs to grows. Takes effect on the next `refresh`.
    pub fn retarget(&self, query: ListQuery) {
        assert_eq!(
            query.table(),
            self.shared.table,
            "A list cannot be retargeted to another table"
        );
        *self.shared.query.lock() = query;
    }

    async fn fetch(&self, query: crate::backend::Select, operation: &'static str) -> SyncResult<Vec<T>> {
        let request = tokio::time::timeout(self.load_timeout, self.backend.select(&query));
        let rows: Vec<Row> = match self.scope.guard(request).await? {
            Err(_) => {
                return Err(SyncError::TimedOut {
                    operation,
                    after: self.load_timeout,
                });
            }
            Ok(Err(err)) if err.is_no_rows() => Vec::new(),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(rows)) => rows,
        };
        decode_rows(&self.shared.table, rows)
    }

    fn report(&self, operation: &str, err: &SyncError) {
        warn!("{operation} on {} failed: {err}", self.shared.table);
        self.alerts.alert(Alert::from_error(err));
    }

    /// Loads the first page. Failures leave held rows untouched, raise one
    /// alert and end in `Failed`.
    pub async fn load(&self) -> SyncResult<LoadState> {
        self.load_first_page(false).await
    }

    /// Re-reads the first page and replaces the held rows with it.
    pub async fn refresh(&self) -> SyncResult<LoadState> {
        self.load_first_page(true).await
    }

    async fn load_first_page(&self, replace: bool) -> SyncResult<LoadState> {
        {
            let mut state = self.shared.state.lock();
            if state.list.is_empty() {
                state.load_state = LoadState::Loading;
            }
        }
        let first_page = self.shared.query.lock().first_page();
        match self.fetch(first_page, "load").await {
            Ok(page) => {
                let fetched = page.len();
                let cursor = page.last().map(Cursor::of);
                let load_state = {
                    let mut state = self.shared.state.lock();
                    if replace {
                        state.list.replace_all(page);
                    } else {
                        state.list.merge_page(page);
                    }
                    state.cursor = cursor;
                    state.has_more = self.shared.query.lock().has_more_after(fetched);
                    state.load_state = if state.list.is_empty() {
                        LoadState::Empty
                    } else {
                        LoadState::Ready
                    };
                    state.load_state.clone()
                };
                info!("Loaded {fetched} rows from {}", self.shared.table);
                self.shared.bump();
                Ok(load_state)
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(err) => {
                self.report("load", &err);
                self.shared.state.lock().load_state = LoadState::Failed(err.user_message());
                self.shared.bump();
                Err(err)
            }
        }
    }

    /// Fetches the page after the cursor. A call while another is pending, or
    /// after the last page, is a no-op returning `Ok(0)`.
    pub async fn load_more(&self) -> SyncResult<usize> {
        let cursor = {
            let state = self.shared.state.lock();
            if !state.has_more {
                return Ok(0);
            }
            match state.cursor.clone() {
                Some(cursor) => cursor,
                None => return Ok(0),
            }
        };
        if self.loading_more.swap(true, Ordering::AcqRel) {
            debug!("load_more on {} already in flight", self.shared.table);
            return Ok(0);
        }
        let _in_flight = InFlight(Arc::clone(&self.loading_more));

        let next_page = self.shared.query.lock().page_after(&cursor);
        match self.fetch(next_page, "load_more").await {
            Ok(page) => {
                let fetched = page.len();
                let next_cursor = page.last().map(Cursor::of);
                let added = {
                    let mut state = self.shared.state.lock();
                    let added = state.list.merge_page(page);
                    if let Some(next) = next_cursor {
                        state.cursor = Some(next);
                    }
                    state.has_more = self.shared.query.lock().has_more_after(fetched);
                    if !state.list.is_empty() {
                        state.load_state = LoadState::Ready;
                    }
                    added
                };
                debug!("Paged {fetched} more rows from {}", self.shared.table);
                self.shared.bump();
                Ok(added)
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(err) => {
                self.report("load_more", &err);
                Err(err)
            }
        }
    }

    /// Opens the realtime channel and pumps its deltas into the list until
    /// the scope is torn down. Returns once the join is acknowledged or
    /// refused, so a fetch started afterwards cannot miss a committed row.
    pub async fn attach(&self, spec: ChannelSpec) -> SyncResult<()> {
        assert_eq!(
            spec.table, self.shared.table,
            "Realtime channel must watch the listed table"
        );
        self.shared.set_channel(ChannelStatus::Joining);
        let subscription = match self.scope.guard(self.backend.subscribe(spec)).await? {
            Ok(subscription) => subscription,
            Err(err) => {
                let err = SyncError::from(err);
                self.report("subscribe", &err);
                self.shared
                    .set_channel(ChannelStatus::Errored(err.user_message()));
                return Err(err);
            }
        };
        let mut events = self.scope.adopt(subscription);
        let open = match self.scope.guard(events.recv()).await? {
            Some(event) => self.shared.handle(event),
            None => self.shared.handle(ChannelEvent::Closed),
        };
        if open {
            self.scope.spawn(pump(Arc::clone(&self.shared), events));
        }
        Ok(())
    }

    /// Ends a load that failed before this list could run it, e.g. when the
    /// rows it depends on could not be read. The caller has already alerted.
    pub fn mark_failed(&self, err: &SyncError) {
        self.shared.state.lock().load_state = LoadState::Failed(err.user_message());
        self.shared.bump();
    }

    /// Applies one realtime delta. Returns whether the list changed.
    pub fn apply_change(&self, change: &ChangeEvent) -> bool {
        self.shared.apply_change(change)
    }

    /// Optimistically edits a held row; returns the value to restore on failure.
    pub fn patch(&self, key: &str, edit: impl FnOnce(&mut T)) -> Option<T> {
        let previous = self.shared.state.lock().list.patch(key, edit);
        if previous.is_some() {
            self.shared.bump();
        }
        previous
    }

    pub fn restore(&self, previous: T) {
        if self.shared.state.lock().list.restore(previous) {
            self.shared.bump();
        }
    }

    /// Inserts or replaces a row the caller already holds, e.g. a mutation's
    /// returned representation.
    pub fn upsert(&self, item: T) -> bool {
        let changed = {
            let mut state = self.shared.state.lock();
            let changed = state.list.upsert(item);
            if changed {
                state.load_state = LoadState::Ready;
            }
            changed
        };
        if changed {
            self.shared.bump();
        }
        changed
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.shared.state.lock().list.items().to_vec()
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.shared.state.lock().list.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .list
            .items()
            .iter()
            .map(|item| item.key().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().list.is_empty()
    }

    pub fn load_state(&self) -> LoadState {
        self.shared.state.lock().load_state.clone()
    }

    pub fn has_more(&self) -> bool {
        self.shared.state.lock().has_more
    }

    pub fn is_loading_more(&self) -> bool {
        self.loading_more.load(Ordering::Acquire)
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.shared.state.lock().channel.clone()
    }

    /// Ticks whenever the list, its load state or its channel status changes.
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

async fn pump<T: Keyed + DeserializeOwned>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        if !shared.handle(event) {
            return;
        }
    }
    shared.handle(ChannelEvent::Closed);
}

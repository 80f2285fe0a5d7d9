//! In-process backend with the hosted service's table, realtime, auth and
//! storage semantics. Used for offline runs and by the test-suite.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use super::{
    AuthEvent, AuthSession, AuthUser, Backend, ChangeEvent, ChangeKind, ChannelEvent,
    ChannelSpec, Filter, FilterOp, Order, Row, Select, Subscription, row_key,
};
use crate::error::BackendError;

const AUTH_SCOPE: &str = "auth";
const SESSION_TTL_SECONDS: i64 = 3_600;
const PUBLIC_URL_BASE: &str = "memory://storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Select,
    Insert,
    Update,
    Delete,
    Subscribe,
    GetUser,
    SignIn,
    SignUp,
    SignOut,
    ResetPassword,
    Refresh,
    Upload,
}

struct MemoryChannel {
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

struct Account {
    user: AuthUser,
    password: String,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    channels: HashMap<u64, MemoryChannel>,
    next_channel: u64,
    failures: HashMap<(String, Op), VecDeque<BackendError>>,
    requests: HashMap<(String, Op), usize>,
    accounts: HashMap<String, Account>,
    session: Option<AuthSession>,
    session_expired: bool,
    password_resets: Vec<String>,
    blobs: HashMap<String, Vec<u8>>,
    last_stamp: Option<DateTime<Utc>>,
    latency: Option<Duration>,
}

impl MemoryState {
    fn record(&mut self, scope: &str, op: Op) -> Result<(), BackendError> {
        *self.requests.entry((scope.to_string(), op)).or_default() += 1;
        if let Some(queue) = self.failures.get_mut(&(scope.to_string(), op)) {
            if let Some(err) = queue.pop_front() {
                tracing::debug!("Injected failure for {scope} {op:?}: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Strictly increasing timestamps so insertion order is also sort order.
    fn stamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn publish(&self, kind: ChangeKind, table: &str, new: Option<&Row>, old: Option<&Row>) {
        for channel in self.channels.values() {
            if channel.spec.table != table {
                continue;
            }
            if channel.spec.kind.is_some_and(|wanted| wanted != kind) {
                continue;
            }
            if let Some(filter) = &channel.spec.filter {
                let hit = new.is_some_and(|row| matches(row, filter))
                    || old.is_some_and(|row| matches(row, filter));
                if !hit {
                    continue;
                }
            }
            let event = ChangeEvent {
                kind,
                table: table.to_string(),
                new: new.cloned(),
                old: old.cloned(),
            };
            if channel.tx.send(ChannelEvent::Change(event)).is_err() {
                tracing::debug!("Channel {} receiver dropped", channel.spec.name);
            }
        }
    }

    fn issue_session(&mut self, user: AuthUser) -> AuthSession {
        let session = AuthSession {
            access_token: random_token(),
            refresh_token: random_token(),
            expires_at: Some(Utc::now().timestamp() + SESSION_TTL_SECONDS),
            user,
        };
        self.session = Some(session.clone());
        self.session_expired = false;
        session
    }
}

/// Backend held entirely in memory. Cloning shares the same state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (auth_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            auth_tx,
        }
    }

    /// Inserts rows without counting a request or publishing events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state.lock();
        for mut row in rows {
            fill_defaults(&mut state, &mut row);
            state.tables.entry(table.to_string()).or_default().push(row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Queues an error returned by the next matching call. Auth calls use the
    /// `"auth"` scope and uploads use the bucket name.
    pub fn fail_next(&self, scope: &str, op: Op, err: BackendError) {
        self.state
            .lock()
            .failures
            .entry((scope.to_string(), op))
            .or_default()
            .push_back(err);
    }

    pub fn request_count(&self, scope: &str, op: Op) -> usize {
        self.state
            .lock()
            .requests
            .get(&(scope.to_string(), op))
            .copied()
            .unwrap_or(0)
    }

    pub fn active_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Reports a server-side error on every open channel named `name`.
    /// Returns how many channels were hit.
    pub fn fail_channel(&self, name: &str, message: &str) -> usize {
        let state = self.state.lock();
        state
            .channels
            .values()
            .filter(|channel| channel.spec.name == name)
            .filter(|channel| {
                channel
                    .tx
                    .send(ChannelEvent::Error(message.to_string()))
                    .is_ok()
            })
            .count()
    }

    /// Closes every open channel named `name` from the server side.
    pub fn close_channel(&self, name: &str) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, channel)| channel.spec.name == name)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(channel) = state.channels.remove(id) {
                let _ = channel.tx.send(ChannelEvent::Closed);
            }
        }
        ids.len()
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Makes the held access token look expired until the next refresh.
    pub fn expire_session(&self) {
        self.state.lock().session_expired = true;
    }

    pub fn password_resets(&self) -> Vec<String> {
        self.state.lock().password_resets.clone()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .get(&format!("{bucket}/{path}"))
            .cloned()
    }

    async fn enter(&self, scope: &str, op: Op) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().record(scope, op)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, BackendError> {
        self.enter(&query.table, Op::Select).await?;
        let state = self.state.lock();
        let mut rows: Vec<Row> = state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|filter| matches(row, filter)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(state);

        sort_rows(&mut rows, &query.order);
        let offset = query.offset.unwrap_or(0);
        let rows = rows
            .into_iter()
            .skip(offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|row| project(row, &query.columns))
            .collect();
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, BackendError> {
        self.enter(table, Op::Insert).await?;
        let mut state = self.state.lock();
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            fill_defaults(&mut state, &mut row);
            inserted.push(row);
        }
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(inserted.iter().cloned());
        for row in &inserted {
            state.publish(ChangeKind::Insert, table, Some(row), None);
        }
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: &[Filter],
    ) -> Result<Vec<Row>, BackendError> {
        self.enter(table, Op::Update).await?;
        let mut state = self.state.lock();
        let mut changes = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut() {
                if !filters.iter().all(|filter| matches(row, filter)) {
                    continue;
                }
                let old = row.clone();
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                changes.push((old, row.clone()));
            }
        }
        for (old, new) in &changes {
            state.publish(ChangeKind::Update, table, Some(new), Some(old));
        }
        Ok(changes.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>, BackendError> {
        self.enter(table, Op::Delete).await?;
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| {
                if filters.iter().all(|filter| matches(row, filter)) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }
        for row in &removed {
            state.publish(ChangeKind::Delete, table, None, Some(row));
        }
        Ok(removed)
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, BackendError> {
        self.enter(&spec.table, Op::Subscribe).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let name = spec.name.clone();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_channel;
            state.next_channel += 1;
            if tx.send(ChannelEvent::Subscribed).is_err() {
                return Err(BackendError::new("realtime receiver dropped during join"));
            }
            state.channels.insert(id, MemoryChannel { spec, tx });
            id
        };
        let state = Arc::downgrade(&self.state);
        Ok(Subscription::new(name, rx, move || {
            if let Some(state) = state.upgrade() {
                state.lock().channels.remove(&id);
            }
        }))
    }

    async fn get_user(&self) -> Result<AuthUser, BackendError> {
        self.enter(AUTH_SCOPE, Op::GetUser).await?;
        let state = self.state.lock();
        let session = state
            .session
            .as_ref()
            .ok_or_else(BackendError::session_missing)?;
        if state.session_expired {
            return Err(BackendError::new("invalid JWT: token is expired").with_status(401));
        }
        Ok(session.user.clone())
    }

    fn current_session(&self) -> Option<AuthSession> {
        self.state.lock().session.clone()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        self.enter(AUTH_SCOPE, Op::SignIn).await?;
        let session = {
            let mut state = self.state.lock();
            let user = match state.accounts.get(&email.to_ascii_lowercase()) {
                Some(account) if account.password == password => account.user.clone(),
                _ => {
                    return Err(BackendError::new("Invalid login credentials")
                        .with_code("invalid_credentials")
                        .with_status(400));
                }
            };
            state.issue_session(user)
        };
        let _ = self.auth_tx.send(AuthEvent::SignedIn(session.user.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, BackendError> {
        self.enter(AUTH_SCOPE, Op::SignUp).await?;
        let email = email.trim().to_ascii_lowercase();
        let mut state = self.state.lock();
        if state.accounts.contains_key(&email) {
            return Err(BackendError::new("User already registered")
                .with_code("user_already_exists")
                .with_status(422));
        }
        let user = AuthUser {
            id: random_token(),
            email: Some(email.clone()),
        };
        state.accounts.insert(
            email.clone(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );

        // Profiles are created server-side on sign-up.
        let username = email.split('@').next().unwrap_or_default().to_string();
        let mut profile = super::object(serde_json::json!({
            "id": user.id,
            "username": username,
            "full_name": null,
            "avatar_url": null,
            "bio": null,
            "is_online": false,
            "last_seen": null,
        }));
        fill_defaults(&mut state, &mut profile);
        state
            .tables
            .entry("profiles".to_string())
            .or_default()
            .push(profile);
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.enter(AUTH_SCOPE, Op::SignOut).await?;
        self.state.lock().session = None;
        let _ = self.auth_tx.send(AuthEvent::SignedOut);
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        self.enter(AUTH_SCOPE, Op::ResetPassword).await?;
        self.state
            .lock()
            .password_resets
            .push(email.trim().to_ascii_lowercase());
        Ok(())
    }

    async fn refresh_session(&self) -> Result<AuthSession, BackendError> {
        self.enter(AUTH_SCOPE, Op::Refresh).await?;
        let session = {
            let mut state = self.state.lock();
            let user = state
                .session
                .as_ref()
                .map(|session| session.user.clone())
                .ok_or_else(BackendError::session_missing)?;
            state.issue_session(user)
        };
        let _ = self
            .auth_tx
            .send(AuthEvent::TokenRefreshed(session.user.clone()));
        Ok(session)
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BackendError> {
        self.enter(bucket, Op::Upload).await?;
        self.state
            .lock()
            .blobs
            .insert(format!("{bucket}/{path}"), bytes);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{PUBLIC_URL_BASE}/{bucket}/{path}")
    }
}

fn fill_defaults(state: &mut MemoryState, row: &mut Row) {
    if row_key(row).is_none() {
        row.insert("id".to_string(), Value::String(random_token()));
    }
    if !row.contains_key("created_at") {
        let stamp = state.stamp();
        row.insert("created_at".to_string(), Value::String(stamp));
    }
}

fn random_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn project(row: Row, columns: &str) -> Row {
    let columns = columns.trim();
    if columns.is_empty() || columns == "*" || columns.contains('(') {
        return row;
    }
    let wanted: Vec<&str> = columns.split(',').map(str::trim).collect();
    row.into_iter()
        .filter(|(column, _)| wanted.contains(&column.as_str()))
        .collect()
}

fn sort_rows(rows: &mut [Row], order: &[Order]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for key in order {
            let left = a.get(&key.column).unwrap_or(&Value::Null);
            let right = b.get(&key.column).unwrap_or(&Value::Null);
            let ordering = order_values(left, right);
            let ordering = if key.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Total order used for sorting; nulls sort after every value.
fn order_values(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare(left, right).unwrap_or(Ordering::Equal),
    }
}

pub(crate) fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::And(filters) => filters.iter().all(|filter| matches(row, filter)),
        Filter::Or(filters) => filters.iter().any(|filter| matches(row, filter)),
        Filter::Cmp { column, op, value } => {
            let actual = row.get(column).unwrap_or(&Value::Null);
            match op {
                FilterOp::Eq => loose_eq(actual, value),
                FilterOp::Neq => !actual.is_null() && !loose_eq(actual, value),
                FilterOp::Lt => compare(actual, value) == Some(Ordering::Less),
                FilterOp::Lte => matches!(
                    compare(actual, value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                FilterOp::Gt => compare(actual, value) == Some(Ordering::Greater),
                FilterOp::Gte => matches!(
                    compare(actual, value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                FilterOp::ILike => match (actual.as_str(), value.as_str()) {
                    (Some(text), Some(pattern)) => ilike(text, pattern),
                    _ => false,
                },
                FilterOp::In => value
                    .as_array()
                    .is_some_and(|values| values.iter().any(|candidate| loose_eq(actual, candidate))),
                FilterOp::Is => match value {
                    Value::Null => actual.is_null(),
                    other => actual == other,
                },
            }
        }
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual.is_null() || expected.is_null() {
        return false;
    }
    if actual == expected || compare(actual, expected) == Some(Ordering::Equal) {
        return true;
    }
    scalar_text(actual) == scalar_text(expected)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => {
            match (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(a), Ok(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.parse::<f64>().ok()?),
        (Value::String(a), Value::Number(b)) => a.parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// SQL `ILIKE` with `%` as the only wildcard.
fn ilike(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let mut rest = text.as_str();
    let first = parts[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::object;
    use serde_json::json;

    fn message(id: &str, room: &str, created_at: &str) -> Row {
        object(json!({"id": id, "chat_room_id": room, "content": id, "created_at": created_at}))
    }

    #[test]
    fn ilike_handles_wildcards() {
        assert!(ilike("Alice", "%li%"));
        assert!(ilike("alice", "AL%"));
        assert!(ilike("alice", "%ce"));
        assert!(!ilike("alice", "%bob%"));
        assert!(ilike("alice", "alice"));
        assert!(!ilike("alice", "ali"));
    }

    #[test]
    fn filters_compare_timestamps_and_ids() {
        let row = message("m2", "r1", "2024-05-01T10:00:00.000000Z");
        assert!(matches(&row, &Filter::lt("created_at", "2024-05-01T11:00:00+00:00")));
        assert!(!matches(&row, &Filter::gt("created_at", "2024-05-01T10:00:00Z")));
        let tie_break = Filter::Or(vec![
            Filter::lt("created_at", "2024-05-01T10:00:00Z"),
            Filter::And(vec![
                Filter::eq("created_at", "2024-05-01T10:00:00Z"),
                Filter::lt("id", "m3"),
            ]),
        ]);
        assert!(matches(&row, &tie_break));
        assert!(matches(&row, &Filter::one_of("chat_room_id", ["r0", "r1"])));
        assert!(matches(&row, &Filter::eq("content", "m2")));
    }

    #[tokio::test]
    async fn select_orders_and_ranges() {
        let backend = MemoryBackend::new();
        backend.seed(
            "messages",
            vec![
                message("a", "r1", "2024-05-01T10:00:00Z"),
                message("b", "r1", "2024-05-01T10:01:00Z"),
                message("c", "r2", "2024-05-01T10:02:00Z"),
                message("d", "r1", "2024-05-01T10:03:00Z"),
            ],
        );
        let rows = backend
            .select(
                &Select::from("messages")
                    .eq("chat_room_id", "r1")
                    .order("created_at", false)
                    .range(0, 1),
            )
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().filter_map(row_key).collect();
        assert_eq!(ids, vec!["d", "b"]);
        assert_eq!(backend.request_count("messages", Op::Select), 1);
    }

    #[tokio::test]
    async fn realtime_fans_out_to_matching_channels() {
        let backend = MemoryBackend::new();
        let mut room = backend
            .subscribe(ChannelSpec::table("room-r1", "messages").filtered("chat_room_id", "r1"))
            .await
            .unwrap();
        assert_eq!(room.next().await, Some(ChannelEvent::Subscribed));
        assert_eq!(backend.active_channels(), 1);

        backend
            .insert("messages", vec![message("x", "r2", "2024-05-01T10:00:00Z")])
            .await
            .unwrap();
        backend
            .insert("messages", vec![message("y", "r1", "2024-05-01T10:00:01Z")])
            .await
            .unwrap();

        match room.next().await {
            Some(ChannelEvent::Change(event)) => {
                assert_eq!(event.kind, ChangeKind::Insert);
                assert_eq!(event.key().as_deref(), Some("y"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        room.unsubscribe();
        assert_eq!(backend.active_channels(), 0);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let backend = MemoryBackend::new();
        backend.fail_next("posts", Op::Select, BackendError::new("permission denied"));
        let err = backend.select(&Select::from("posts")).await.unwrap_err();
        assert_eq!(err.message, "permission denied");
        assert!(backend.select(&Select::from("posts")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sign_up_creates_profile_and_sign_in_issues_session() {
        let backend = MemoryBackend::new();
        let user = backend.sign_up("Ada@Example.com", "hunter22").await.unwrap();
        assert_eq!(backend.rows("profiles").len(), 1);
        assert!(backend.get_user().await.unwrap_err().is_session_missing());

        let mut events = backend.auth_events();
        let session = backend
            .sign_in_with_password("ada@example.com", "hunter22")
            .await
            .unwrap();
        assert_eq!(session.user, user);
        assert_eq!(events.recv().await.unwrap(), AuthEvent::SignedIn(user.clone()));

        backend.expire_session();
        assert!(backend.get_user().await.unwrap_err().is_session_expired());
        backend.refresh_session().await.unwrap();
        assert_eq!(backend.get_user().await.unwrap(), user);
    }
}

//! Client surface of the hosted backend: tables, realtime change feeds, auth
//! and blob storage.
//!
//! Everything above this module talks to a `dyn Backend`. Two implementations
//! exist: [`rest::RestBackend`] for the hosted service and
//! [`memory::MemoryBackend`] for offline runs and tests.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::{BackendError, SyncError, SyncResult};

pub mod memory;
pub mod realtime;
pub mod rest;

/// A table row as delivered by the backend.
pub type Row = serde_json::Map<String, Value>;

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    ILike,
    In,
    Is,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::ILike => "ilike",
            FilterOp::In => "in",
            FilterOp::Is => "is",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Cmp {
        column: String,
        op: FilterOp,
        value: Value,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn cmp(column: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        assert!(!column.is_empty(), "Filter column cannot be empty");
        Filter::Cmp {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::cmp(column, FilterOp::Eq, value)
    }

    pub fn neq(column: &str, value: impl Into<Value>) -> Self {
        Self::cmp(column, FilterOp::Neq, value)
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Self::cmp(column, FilterOp::Lt, value)
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Self::cmp(column, FilterOp::Gt, value)
    }

    /// Case-insensitive match; `%` is the wildcard.
    pub fn ilike(column: &str, pattern: &str) -> Self {
        Self::cmp(column, FilterOp::ILike, pattern)
    }

    pub fn one_of<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::cmp(column, FilterOp::In, Value::Array(values))
    }

    pub fn is_null(column: &str) -> Self {
        Self::cmp(column, FilterOp::Is, Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A filtered, ordered, range-bounded read.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(table: &str) -> Self {
        assert!(!table.is_empty(), "Table name cannot be empty");
        Self {
            table: table.to_string(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    /// Inclusive row range, as the backend's `range(start, end)`.
    pub fn range(mut self, start: usize, end: usize) -> Self {
        assert!(end >= start, "Range end must not precede start");
        self.offset = Some(start);
        self.limit = Some(end - start + 1);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        assert!(limit > 0, "Limit must be positive");
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// What one realtime channel listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub filter: Option<Filter>,
    /// `None` listens to every change kind.
    pub kind: Option<ChangeKind>,
}

impl ChannelSpec {
    pub fn table(name: &str, table: &str) -> Self {
        assert!(!name.is_empty(), "Channel name cannot be empty");
        Self {
            name: name.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.to_string(),
            filter: None,
            kind: None,
        }
    }

    /// Realtime filters only support a single `column=eq.value` predicate.
    pub fn filtered(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filter = Some(Filter::eq(column, value));
        self
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl ChangeEvent {
    /// Primary key of the affected row, taken from the new image and falling
    /// back to the old one.
    pub fn key(&self) -> Option<String> {
        self.new
            .as_ref()
            .and_then(row_key)
            .or_else(|| self.old.as_ref().and_then(row_key))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Subscribed,
    Change(ChangeEvent),
    Error(String),
    Closed,
}

/// Release side of a realtime channel. Runs its release action exactly once,
/// either through [`ChannelHandle::release`] or on drop.
pub struct ChannelHandle {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!("Releasing realtime channel {}", self.name);
            release();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Live realtime channel: an event stream plus its release handle.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: ChannelHandle,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            handle: ChannelHandle {
                name: name.into(),
                release: Some(Box::new(release)),
            },
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        self.handle.release();
    }

    /// Splits the stream from its release handle so that the stream can be
    /// pumped by a task while the handle stays with the owner.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChannelEvent>, ChannelHandle) {
        (self.events, self.handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthUser),
    SignedOut,
    TokenRefreshed(AuthUser),
    UserUpdated(AuthUser),
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, BackendError>;

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, BackendError>;

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: &[Filter],
    ) -> Result<Vec<Row>, BackendError>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>, BackendError>;

    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, BackendError>;

    async fn get_user(&self) -> Result<AuthUser, BackendError>;

    fn current_session(&self) -> Option<AuthSession>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError>;

    async fn refresh_session(&self) -> Result<AuthSession, BackendError>;

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Single-row read; an empty result is a no-rows error.
pub async fn fetch_one(backend: &dyn Backend, query: Select) -> Result<Row, BackendError> {
    let table = query.table.clone();
    let rows = backend.select(&query.limit(1)).await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| BackendError::no_rows(&table))
}

pub async fn fetch_optional(
    backend: &dyn Backend,
    query: Select,
) -> Result<Option<Row>, BackendError> {
    match fetch_one(backend, query).await {
        Ok(row) => Ok(Some(row)),
        Err(err) if err.is_no_rows() => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn decode_row<T: DeserializeOwned>(table: &str, row: Row) -> SyncResult<T> {
    serde_json::from_value(Value::Object(row)).map_err(|source| SyncError::Decode {
        table: table.to_string(),
        source,
    })
}

pub fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Row>) -> SyncResult<Vec<T>> {
    rows.into_iter().map(|row| decode_row(table, row)).collect()
}

/// Builds a row from a `json!` object literal.
pub fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => {
            tracing::warn!("Expected a JSON object for a row, got {other}");
            Row::new()
        }
    }
}

/// Primary key of a row; numeric ids are rendered as strings.
pub fn row_key(row: &Row) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

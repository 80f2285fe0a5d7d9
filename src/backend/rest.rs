use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::realtime;
use super::{
    AuthEvent, AuthSession, AuthUser, Backend, ChannelSpec, Filter, FilterOp, Order, Row, Select,
    Subscription,
};
use crate::config::{BackendConfig, RealtimeConfig};
use crate::error::{BackendError, ErrorBody};

/// Hosted backend reached over its table, auth, storage and realtime APIs.
#[derive(Clone)]
pub struct RestBackend {
    http: Client,
    base_url: String,
    anon_key: String,
    realtime: RealtimeConfig,
    session: Arc<RwLock<Option<AuthSession>>>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl RestBackend {
    pub fn new(config: &BackendConfig, realtime: &RealtimeConfig) -> Result<Self> {
        assert!(!config.url.is_empty(), "Backend URL must be provided");
        assert!(!config.anon_key.is_empty(), "Backend anon key must be provided");
        let timeout = config.request_timeout();
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", config.url))?;
        let (auth_tx, _) = broadcast::channel(64);

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            realtime: realtime.clone(),
            session: Arc::new(RwLock::new(None)),
            auth_tx,
        })
    }

    fn bearer(&self) -> String {
        self.session
            .read()
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.anon_key
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.send().await.map_err(BackendError::transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => parsed.into_error(status.as_u16()),
            Err(_) if !body.trim().is_empty() => {
                BackendError::new(body.trim().to_string()).with_status(status.as_u16())
            }
            Err(_) => ErrorBody::default().into_error(status.as_u16()),
        };
        debug!("Backend responded {status}: {error}");
        Err(error)
    }

    async fn rows(response: Response) -> Result<Vec<Row>, BackendError> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let body = response.text().await.map_err(BackendError::transport)?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)
            .map_err(|err| BackendError::new(format!("malformed rows payload: {err}")))?
        {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect()),
            Value::Object(row) => Ok(vec![row]),
            other => Err(BackendError::new(format!(
                "unexpected rows payload: {other}"
            ))),
        }
    }

    fn store_session(&self, session: AuthSession, event: AuthEvent) -> AuthSession {
        *self.session.write() = Some(session.clone());
        if self.auth_tx.send(event).is_err() {
            debug!("No auth listeners attached");
        }
        session
    }

    async fn token_grant(&self, grant: &str, body: Value) -> Result<TokenResponse, BackendError> {
        let request = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant)])
            .header("apikey", &self.anon_key)
            .json(&body);
        let response = self.execute(request).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| BackendError::new(format!("malformed token response: {err}")))
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, BackendError> {
        let mut params = vec![("select".to_string(), query.columns.clone())];
        params.extend(query.filters.iter().map(filter_param));
        if !query.order.is_empty() {
            params.push(("order".to_string(), order_param(&query.order)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = query.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }

        let request = self.authorized(self.http.get(self.table_url(&query.table)).query(&params));
        let response = self.execute(request).await?;
        Self::rows(response).await
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, BackendError> {
        assert!(!rows.is_empty(), "Insert requires at least one row");
        let request = self.authorized(
            self.http
                .post(self.table_url(table))
                .header("Prefer", "return=representation")
                .json(&rows),
        );
        let response = self.execute(request).await?;
        Self::rows(response).await
    }

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: &[Filter],
    ) -> Result<Vec<Row>, BackendError> {
        assert!(!filters.is_empty(), "Unfiltered updates are refused");
        let params: Vec<(String, String)> = filters.iter().map(filter_param).collect();
        let request = self.authorized(
            self.http
                .patch(self.table_url(table))
                .query(&params)
                .header("Prefer", "return=representation")
                .json(&patch),
        );
        let response = self.execute(request).await?;
        Self::rows(response).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>, BackendError> {
        assert!(!filters.is_empty(), "Unfiltered deletes are refused");
        let params: Vec<(String, String)> = filters.iter().map(filter_param).collect();
        let request = self.authorized(
            self.http
                .delete(self.table_url(table))
                .query(&params)
                .header("Prefer", "return=representation"),
        );
        let response = self.execute(request).await?;
        Self::rows(response).await
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription, BackendError> {
        realtime::connect(&self.realtime_url(), spec, self.bearer(), &self.realtime).await
    }

    async fn get_user(&self) -> Result<AuthUser, BackendError> {
        let token = self
            .session
            .read()
            .as_ref()
            .map(|session| session.access_token.clone())
            .ok_or_else(BackendError::session_missing)?;
        let request = self
            .http
            .get(self.auth_url("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(token);
        let response = self.execute(request).await?;
        response
            .json::<AuthUser>()
            .await
            .map_err(|err| BackendError::new(format!("malformed user payload: {err}")))
    }

    fn current_session(&self) -> Option<AuthSession> {
        self.session.read().clone()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let token = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        let session = token.into_session()?;
        info!("Signed in as {}", session.user.id);
        let event = AuthEvent::SignedIn(session.user.clone());
        Ok(self.store_session(session, event))
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, BackendError> {
        let request = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }));
        let response = self.execute(request).await?;
        let payload: SignUpResponse = response
            .json()
            .await
            .map_err(|err| BackendError::new(format!("malformed sign-up response: {err}")))?;

        // Auto-confirmed projects answer with a full session.
        if payload.token.access_token.is_some() {
            let session = payload.token.into_session()?;
            let user = session.user.clone();
            self.store_session(session, AuthEvent::SignedIn(user.clone()));
            return Ok(user);
        }
        payload
            .token
            .user
            .or_else(|| {
                payload.id.map(|id| AuthUser {
                    id,
                    email: payload.email,
                })
            })
            .ok_or_else(|| BackendError::new("sign-up response carried no user"))
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let has_session = self.session.read().is_some();
        if has_session {
            let request = self.authorized(self.http.post(self.auth_url("logout")));
            match self.execute(request).await {
                Ok(_) => {}
                // Already revoked server-side; the local session still goes.
                Err(err) if err.is_session_expired() || err.status == Some(404) => {
                    warn!("Sign-out with stale session: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        *self.session.write() = None;
        if self.auth_tx.send(AuthEvent::SignedOut).is_err() {
            debug!("No auth listeners attached");
        }
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        let request = self
            .http
            .post(self.auth_url("recover"))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email }));
        self.execute(request).await?;
        Ok(())
    }

    async fn refresh_session(&self) -> Result<AuthSession, BackendError> {
        let refresh_token = self
            .session
            .read()
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .ok_or_else(BackendError::session_missing)?;
        let token = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        let session = token.into_session()?;
        debug!("Session refreshed for {}", session.user.id);
        let event = AuthEvent::TokenRefreshed(session.user.clone());
        Ok(self.store_session(session, event))
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        let request = self.authorized(
            self.http
                .post(url)
                .header("Content-Type", content_type)
                .header("x-upsert", "true")
                .body(bytes),
        );
        self.execute(request).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Option<AuthUser>,
}

impl TokenResponse {
    fn into_session(self) -> Result<AuthSession, BackendError> {
        let access_token = self
            .access_token
            .ok_or_else(|| BackendError::new("token response carried no access token"))?;
        let user = self
            .user
            .ok_or_else(|| BackendError::new("token response carried no user"))?;
        let expires_at = self
            .expires_at
            .or_else(|| {
                self.expires_in
                    .map(|seconds| chrono::Utc::now().timestamp() + seconds)
            })
            .or_else(|| jwt_expiry(&access_token));
        Ok(AuthSession {
            access_token,
            refresh_token: self.refresh_token.unwrap_or_default(),
            expires_at,
            user,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SignUpResponse {
    #[serde(flatten)]
    token: TokenResponse,
    id: Option<String>,
    email: Option<String>,
}

/// Reads the `exp` claim of a JWT without verifying it.
pub(crate) fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let decoded = BASE64_URL.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

/// Top-level query parameter for one filter.
pub(crate) fn filter_param(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Cmp { column, op, value } => {
            (column.clone(), format!("{}.{}", op.as_str(), operand(*op, value, false)))
        }
        Filter::And(filters) => ("and".to_string(), group(filters)),
        Filter::Or(filters) => ("or".to_string(), group(filters)),
    }
}

fn group(filters: &[Filter]) -> String {
    let parts: Vec<String> = filters.iter().map(nested).collect();
    format!("({})", parts.join(","))
}

fn nested(filter: &Filter) -> String {
    match filter {
        Filter::Cmp { column, op, value } => {
            format!("{column}.{}.{}", op.as_str(), operand(*op, value, true))
        }
        Filter::And(filters) => format!("and{}", group(filters)),
        Filter::Or(filters) => format!("or{}", group(filters)),
    }
}

fn operand(op: FilterOp, value: &Value, inside_group: bool) -> String {
    match op {
        FilterOp::In => {
            let items: Vec<String> = value
                .as_array()
                .map(|values| values.iter().map(|item| quoted(&scalar(item))).collect())
                .unwrap_or_default();
            format!("({})", items.join(","))
        }
        FilterOp::ILike => {
            let pattern = scalar(value).replace('%', "*");
            if inside_group { quoted(&pattern) } else { pattern }
        }
        FilterOp::Is => match value {
            Value::Null => "null".to_string(),
            other => scalar(other),
        },
        _ => {
            let text = scalar(value);
            if inside_group { quoted(&text) } else { text }
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Quotes values containing characters reserved inside filter groups.
fn quoted(text: &str) -> String {
    let reserved = |c: char| matches!(c, ',' | '.' | ':' | '(' | ')' | '"' | ' ' | '\\');
    if text.chars().any(reserved) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text.to_string()
    }
}

pub(crate) fn order_param(order: &[Order]) -> String {
    order
        .iter()
        .map(|key| {
            let direction = if key.ascending { "asc" } else { "desc" };
            format!("{}.{direction}", key.column)
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::row_key;
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[test]
    fn encodes_top_level_filters() {
        assert_eq!(
            filter_param(&Filter::eq("chat_room_id", "r1")),
            ("chat_room_id".to_string(), "eq.r1".to_string())
        );
        assert_eq!(
            filter_param(&Filter::ilike("username", "%ada%")),
            ("username".to_string(), "ilike.*ada*".to_string())
        );
        assert_eq!(
            filter_param(&Filter::one_of("id", ["a", "b c"])),
            ("id".to_string(), "in.(a,\"b c\")".to_string())
        );
        assert_eq!(
            filter_param(&Filter::is_null("last_seen")),
            ("last_seen".to_string(), "is.null".to_string())
        );
    }

    #[test]
    fn encodes_cursor_group_with_quoted_timestamps() {
        let cursor = Filter::Or(vec![
            Filter::lt("created_at", "2024-05-01T10:00:00.000000Z"),
            Filter::And(vec![
                Filter::eq("created_at", "2024-05-01T10:00:00.000000Z"),
                Filter::lt("id", "m9"),
            ]),
        ]);
        let (key, value) = filter_param(&cursor);
        assert_eq!(key, "or");
        assert_eq!(
            value,
            "(created_at.lt.\"2024-05-01T10:00:00.000000Z\",and(created_at.eq.\"2024-05-01T10:00:00.000000Z\",id.lt.m9))"
        );
    }

    #[test]
    fn encodes_order() {
        let order = vec![
            Order {
                column: "created_at".to_string(),
                ascending: false,
            },
            Order {
                column: "id".to_string(),
                ascending: true,
            },
        ];
        assert_eq!(order_param(&order), "created_at.desc,id.asc");
    }

    #[test]
    fn reads_jwt_expiry() {
        let claims = BASE64_URL.encode(br#"{"sub":"u1","exp":1736650292}"#);
        let token = format!("header.{claims}.signature");
        assert_eq!(jwt_expiry(&token), Some(1_736_650_292));
        assert_eq!(jwt_expiry("not-a-jwt"), None);
    }

    async fn list_messages(
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Json<Value> {
        let apikey = headers
            .get("apikey")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(json!([{ "id": 7, "params": params, "apikey": apikey }]))
    }

    async fn token(
        Query(params): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        let grant = params.get("grant_type").cloned().unwrap_or_default();
        if grant == "password" && body["password"] == "correct horse" {
            return (
                AxumStatus::OK,
                Json(json!({
                    "access_token": "access-1",
                    "refresh_token": "refresh-1",
                    "expires_in": 3600,
                    "user": { "id": "u1", "email": body["email"] }
                })),
            );
        }
        (
            AxumStatus::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" })),
        )
    }

    async fn spawn_mock() -> String {
        let app = Router::new()
            .route("/rest/v1/messages", get(list_messages))
            .route(
                "/rest/v1/secrets",
                get(|| async {
                    (
                        AxumStatus::FORBIDDEN,
                        Json(json!({ "message": "permission denied for table secrets", "code": "42501" })),
                    )
                }),
            )
            .route("/auth/v1/token", post(token));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock backend runs");
        });
        format!("http://{addr}")
    }

    fn backend_for(url: String) -> RestBackend {
        let config = BackendConfig {
            mode: crate::config::BackendMode::Rest,
            url,
            anon_key: "anon-key".to_string(),
            request_timeout_ms: Some(5_000),
        };
        RestBackend::new(&config, &RealtimeConfig::default()).expect("backend builds")
    }

    #[tokio::test]
    async fn select_sends_encoded_query() {
        let backend = backend_for(spawn_mock().await);
        let rows = backend
            .select(
                &Select::from("messages")
                    .eq("chat_room_id", "r1")
                    .order("created_at", false)
                    .order("id", false)
                    .limit(20),
            )
            .await
            .expect("select succeeds");

        assert_eq!(rows.len(), 1);
        assert_eq!(row_key(&rows[0]).as_deref(), Some("7"));
        let params = &rows[0]["params"];
        assert_eq!(params["chat_room_id"], "eq.r1");
        assert_eq!(params["order"], "created_at.desc,id.desc");
        assert_eq!(params["limit"], "20");
        assert_eq!(params["select"], "*");
        assert_eq!(rows[0]["apikey"], "anon-key");
    }

    #[tokio::test]
    async fn backend_errors_keep_message_and_code() {
        let backend = backend_for(spawn_mock().await);
        let err = backend
            .select(&Select::from("secrets"))
            .await
            .expect_err("forbidden");
        assert_eq!(err.message, "permission denied for table secrets");
        assert_eq!(err.code.as_deref(), Some("42501"));
        assert_eq!(err.status, Some(403));
    }

    #[tokio::test]
    async fn password_sign_in_stores_session_and_broadcasts() {
        let backend = backend_for(spawn_mock().await);
        let mut events = backend.auth_events();

        let err = backend
            .sign_in_with_password("ada@example.com", "wrong")
            .await
            .expect_err("bad password");
        assert_eq!(err.message, "Invalid login credentials");
        assert!(backend.current_session().is_none());

        let session = backend
            .sign_in_with_password("ada@example.com", "correct horse")
            .await
            .expect("sign in");
        assert_eq!(session.user.id, "u1");
        assert!(session.expires_at.is_some());
        assert_eq!(backend.bearer(), "access-1");
        assert_eq!(
            events.recv().await.expect("auth event"),
            AuthEvent::SignedIn(session.user.clone())
        );
    }

    #[test]
    fn realtime_url_switches_scheme() {
        let backend = backend_for("https://demo.supabase.co/".to_string());
        assert_eq!(
            backend.realtime_url(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        assert_eq!(
            backend.public_url("avatars", "u1.jpg"),
            "https://demo.supabase.co/storage/v1/object/public/avatars/u1.jpg"
        );
    }
}

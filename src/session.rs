//! Who is signed in, kept current for the lifetime of the app.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::backend::{AuthEvent, AuthUser, Backend, Filter, object};
use crate::error::{SyncError, SyncResult};
use crate::scope::ScreenScope;

/// Tokens are refreshed this long before they expire.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);
const REFRESH_RETRY: Duration = Duration::from_secs(5);
const MIN_REFRESH_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Authenticated(AuthUser),
    SignedOut,
    /// The session expired and could not be refreshed; the user must sign in
    /// again.
    ReauthRequired,
}

pub struct SessionHolder {
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    current: Arc<watch::Sender<Option<AuthUser>>>,
    auto_refresh: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHolder {
    pub fn new(backend: Arc<dyn Backend>, alerts: Arc<dyn AlertSink>) -> Self {
        let initial = backend.current_session().map(|session| session.user);
        let (current, _) = watch::channel(initial);
        Self {
            backend,
            alerts,
            current: Arc::new(current),
            auto_refresh: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<AuthUser> {
        self.current.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<AuthUser>> {
        self.current.subscribe()
    }

    /// Resolves the signed-in identity. An expired session is refreshed once;
    /// when that fails the user is alerted and must sign in again.
    pub async fn resolve(&self) -> SyncResult<SessionOutcome> {
        match self.backend.get_user().await {
            Ok(user) => {
                self.current.send_replace(Some(user.clone()));
                Ok(SessionOutcome::Authenticated(user))
            }
            Err(err) if err.is_session_missing() => {
                debug!("No session held");
                self.current.send_replace(None);
                Ok(SessionOutcome::SignedOut)
            }
            Err(err) if err.is_session_expired() => {
                info!("Session expired, attempting refresh");
                match self.backend.refresh_session().await {
                    Ok(session) => {
                        self.current.send_replace(Some(session.user.clone()));
                        Ok(SessionOutcome::Authenticated(session.user))
                    }
                    Err(refresh_err) => {
                        warn!("Session refresh failed: {refresh_err}");
                        self.current.send_replace(None);
                        self.alerts.alert(Alert::from_error(&SyncError::SessionExpired));
                        Ok(SessionOutcome::ReauthRequired)
                    }
                }
            }
            Err(err) => {
                let err = SyncError::from(err);
                warn!("Failed to resolve session: {err}");
                self.alerts.alert(Alert::from_error(&err));
                Err(err)
            }
        }
    }

    /// The signed-in user, or the reason there is none.
    pub async fn require_user(&self) -> SyncResult<AuthUser> {
        match self.resolve().await? {
            SessionOutcome::Authenticated(user) => Ok(user),
            SessionOutcome::SignedOut => Err(SyncError::NotAuthenticated),
            SessionOutcome::ReauthRequired => Err(SyncError::SessionExpired),
        }
    }

    /// Follows auth events for as long as `scope` is mounted.
    pub fn watch_auth(&self, scope: &ScreenScope) {
        let mut events = self.backend.auth_events();
        let current = Arc::clone(&self.current);
        let name = scope.name().to_string();
        scope.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => apply_auth_event(&current, event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Auth listener for {name} skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Foreground starts token auto-refresh and marks the user online;
    /// background stops it and records last-seen.
    pub async fn set_foreground(&self, foreground: bool) {
        if foreground {
            self.start_auto_refresh();
        } else {
            self.stop_auto_refresh();
        }
        if let Some(user) = self.current() {
            self.update_presence(&user.id, foreground).await;
        }
    }

    pub fn auto_refresh_running(&self) -> bool {
        self.auto_refresh
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn start_auto_refresh(&self) {
        let mut slot = self.auto_refresh.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let current = Arc::clone(&self.current);
        *slot = Some(tokio::spawn(auto_refresh(backend, current)));
        debug!("Token auto-refresh started");
    }

    fn stop_auto_refresh(&self) {
        if let Some(task) = self.auto_refresh.lock().take() {
            task.abort();
            debug!("Token auto-refresh stopped");
        }
    }

    async fn update_presence(&self, user_id: &str, online: bool) {
        let patch = object(json!({
            "is_online": online,
            "last_seen": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }));
        if let Err(err) = self
            .backend
            .update("profiles", patch, &[Filter::eq("id", user_id)])
            .await
        {
            warn!("Failed to update presence for {user_id}: {err}");
        }
    }
}

impl Drop for SessionHolder {
    fn drop(&mut self) {
        self.stop_auto_refresh();
    }
}

fn apply_auth_event(current: &watch::Sender<Option<AuthUser>>, event: AuthEvent) {
    match event {
        AuthEvent::SignedIn(user) | AuthEvent::TokenRefreshed(user) | AuthEvent::UserUpdated(user) => {
            debug!("Auth state now {}", user.id);
            current.send_replace(Some(user));
        }
        AuthEvent::SignedOut => {
            debug!("Auth state signed out");
            current.send_replace(None);
        }
    }
}

fn refresh_wait(expires_at: Option<i64>) -> Duration {
    let Some(expires_at) = expires_at else {
        return REFRESH_MARGIN;
    };
    let remaining = expires_at - Utc::now().timestamp() - REFRESH_MARGIN.as_secs() as i64;
    if remaining <= 0 {
        MIN_REFRESH_WAIT
    } else {
        Duration::from_secs(remaining as u64)
    }
}

async fn auto_refresh(backend: Arc<dyn Backend>, current: Arc<watch::Sender<Option<AuthUser>>>) {
    loop {
        let Some(session) = backend.current_session() else {
            debug!("Auto-refresh idle without a session");
            tokio::time::sleep(REFRESH_MARGIN).await;
            continue;
        };
        tokio::time::sleep(refresh_wait(session.expires_at)).await;
        match backend.refresh_session().await {
            Ok(session) => {
                current.send_replace(Some(session.user));
            }
            Err(err) if err.is_transient() => {
                warn!("Token refresh failed, retrying: {err}");
                tokio::time::sleep(REFRESH_RETRY).await;
            }
            Err(err) => {
                warn!("Token refresh rejected, stopping auto-refresh: {err}");
                current.send_replace(None);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLog;
    use crate::backend::memory::{MemoryBackend, Op};
    use crate::backend::{Select, fetch_one};
    use crate::error::BackendError;

    async fn signed_in() -> (MemoryBackend, AlertLog, SessionHolder) {
        let backend = MemoryBackend::new();
        backend
            .sign_up("ada@example.com", "correct horse")
            .await
            .expect("sign up");
        backend
            .sign_in_with_password("ada@example.com", "correct horse")
            .await
            .expect("sign in");
        let alerts = AlertLog::new();
        let holder = SessionHolder::new(Arc::new(backend.clone()), Arc::new(alerts.clone()));
        (backend, alerts, holder)
    }

    #[tokio::test]
    async fn resolves_the_signed_in_user() {
        let (_backend, alerts, holder) = signed_in().await;
        let outcome = holder.resolve().await.expect("resolves");
        let SessionOutcome::Authenticated(user) = outcome else {
            panic!("expected an authenticated user");
        };
        assert_eq!(user.email.as_deref(), Some("ada@example.com"));
        assert_eq!(holder.current(), Some(user));
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn missing_session_is_signed_out_without_alert() {
        let backend = MemoryBackend::new();
        let alerts = AlertLog::new();
        let holder = SessionHolder::new(Arc::new(backend), Arc::new(alerts.clone()));
        assert_eq!(holder.resolve().await.unwrap(), SessionOutcome::SignedOut);
        assert!(matches!(
            holder.require_user().await,
            Err(SyncError::NotAuthenticated)
        ));
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn expired_session_refreshes_once() {
        let (backend, alerts, holder) = signed_in().await;
        backend.expire_session();
        let outcome = holder.resolve().await.expect("resolves");
        assert!(matches!(outcome, SessionOutcome::Authenticated(_)));
        assert_eq!(backend.request_count("auth", Op::Refresh), 1);
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_requires_reauth_with_one_alert() {
        let (backend, alerts, holder) = signed_in().await;
        backend.expire_session();
        backend.fail_next(
            "auth",
            Op::Refresh,
            BackendError::new("Invalid Refresh Token").with_status(400),
        );
        assert_eq!(holder.resolve().await.unwrap(), SessionOutcome::ReauthRequired);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts.snapshot()[0].title, "Session expired");
        assert!(holder.current().is_none());
    }

    #[tokio::test]
    async fn other_failures_alert_and_propagate() {
        let (backend, alerts, holder) = signed_in().await;
        backend.fail_next("auth", Op::GetUser, BackendError::new("upstream unavailable").with_status(503));
        assert!(holder.resolve().await.is_err());
        assert_eq!(alerts.messages(), vec!["upstream unavailable".to_string()]);
    }

    #[tokio::test]
    async fn auth_events_follow_scope_lifetime() {
        let (backend, _alerts, holder) = signed_in().await;
        let scope = ScreenScope::new("settings");
        holder.watch_auth(&scope);
        let mut watched = holder.watch();

        backend.sign_out().await.expect("sign out");
        while watched.borrow_and_update().is_some() {
            watched.changed().await.expect("holder alive");
        }
        assert!(holder.current().is_none());
        scope.teardown();
    }

    #[tokio::test]
    async fn foreground_toggles_refresh_and_presence() {
        let (backend, _alerts, holder) = signed_in().await;
        let user = holder.require_user().await.expect("user");

        holder.set_foreground(true).await;
        assert!(holder.auto_refresh_running());
        let profile = fetch_one(&backend, Select::from("profiles").eq("id", user.id.clone()))
            .await
            .expect("profile row");
        assert_eq!(profile["is_online"], true);

        holder.set_foreground(false).await;
        assert!(!holder.auto_refresh_running());
        let profile = fetch_one(&backend, Select::from("profiles").eq("id", user.id.clone()))
            .await
            .expect("profile row");
        assert_eq!(profile["is_online"], false);
        assert!(profile["last_seen"].is_string());
    }

    #[test]
    fn refresh_waits_until_margin_before_expiry() {
        let soon = Utc::now().timestamp() + 30;
        assert_eq!(refresh_wait(Some(soon)), MIN_REFRESH_WAIT);
        let later = Utc::now().timestamp() + 3_600;
        let wait = refresh_wait(Some(later));
        assert!(wait > Duration::from_secs(3_400) && wait <= Duration::from_secs(3_540));
    }
}

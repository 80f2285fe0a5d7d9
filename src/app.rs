use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::alerts::{AlertSink, TracingAlerts};
use crate::auth::AuthFlows;
use crate::backend::Backend;
use crate::backend::memory::MemoryBackend;
use crate::backend::rest::RestBackend;
use crate::config::{BackendMode, ClientConfig};
use crate::error::SyncResult;
use crate::models::Profile;
use crate::profiles::ProfileDirectory;
use crate::scope::ScreenScope;
use crate::session::SessionHolder;
use crate::sync::{Keyed, ListQuery, SortOrder, SyncedList};
use crate::wallet::WalletService;

/// Everything a screen needs, built once at startup and passed down.
pub struct AppContext {
    config: ClientConfig,
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    session: SessionHolder,
    profiles: Arc<ProfileDirectory>,
    auth: AuthFlows,
    wallets: WalletService,
    scopes: Mutex<Vec<Weak<ScreenScope>>>,
}

impl AppContext {
    pub fn new(config: ClientConfig, backend: Arc<dyn Backend>, alerts: Arc<dyn AlertSink>) -> Self {
        let session = SessionHolder::new(Arc::clone(&backend), Arc::clone(&alerts));
        let profiles = Arc::new(ProfileDirectory::new(
            Arc::clone(&backend),
            Arc::clone(&alerts),
            &config.cache,
        ));
        let auth = AuthFlows::new(Arc::clone(&backend), Arc::clone(&alerts));
        let wallets = WalletService::new(Arc::clone(&backend), Arc::clone(&alerts), config.wallet.clone());
        Self {
            config,
            backend,
            alerts,
            session,
            profiles,
            auth,
            wallets,
            scopes: Mutex::new(Vec::new()),
        }
    }

    /// Builds the backend named by `config.backend.mode` with log-only alerts.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend.mode {
            BackendMode::Rest => Arc::new(
                RestBackend::new(&config.backend, &config.realtime)
                    .context("Failed to initialize backend client")?,
            ),
            BackendMode::Memory => Arc::new(MemoryBackend::new()),
        };
        info!("Backend mode {:?}", config.backend.mode);
        Ok(Self::new(config, backend, Arc::new(TracingAlerts)))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub fn session(&self) -> &SessionHolder {
        &self.session
    }

    pub fn profiles(&self) -> &Arc<ProfileDirectory> {
        &self.profiles
    }

    pub fn auth(&self) -> &AuthFlows {
        &self.auth
    }

    pub fn wallets(&self) -> &WalletService {
        &self.wallets
    }

    pub fn page_size(&self) -> usize {
        self.config.pagination.page_size
    }

    /// A new screen lifetime, torn down at the latest by [`AppContext::shutdown`].
    pub fn open_scope(&self, name: &str) -> Arc<ScreenScope> {
        let scope = Arc::new(ScreenScope::new(name));
        let mut scopes = self.scopes.lock();
        scopes.retain(|scope| scope.strong_count() > 0);
        scopes.push(Arc::downgrade(&scope));
        scope
    }

    pub fn live_scopes(&self) -> usize {
        self.scopes
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|scope| scope.is_active())
            .count()
    }

    pub fn list<T: Keyed + DeserializeOwned>(
        &self,
        scope: &Arc<ScreenScope>,
        query: ListQuery,
        order: SortOrder,
    ) -> SyncedList<T> {
        SyncedList::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.alerts),
            Arc::clone(scope),
            query,
            order,
            self.config.screens.load_timeout(),
        )
    }

    /// The signed-in user's own profile row.
    pub async fn current_profile(&self) -> SyncResult<Option<Arc<Profile>>> {
        let user = self.session.require_user().await?;
        self.profiles.get(&user.id).await
    }

    /// Tears down every open scope and goes to background. Returns how many
    /// scopes were still live.
    pub async fn shutdown(&self) -> usize {
        let scopes: Vec<Arc<ScreenScope>> = self
            .scopes
            .lock()
            .drain(..)
            .filter_map(|scope| scope.upgrade())
            .collect();
        let torn_down = scopes.iter().filter(|scope| scope.teardown()).count();
        self.session.set_foreground(false).await;
        info!("Shut down {torn_down} screen scopes");
        torn_down
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerts::AlertLog;
    use crate::backend::AuthUser;

    pub(crate) struct TestApp {
        pub backend: MemoryBackend,
        pub alerts: AlertLog,
        pub app: AppContext,
    }

    pub(crate) fn test_app() -> TestApp {
        let backend = MemoryBackend::new();
        let alerts = AlertLog::new();
        let mut config = ClientConfig::memory();
        config.wallet.backoff_base_ms = 1;
        let app = AppContext::new(config, Arc::new(backend.clone()), Arc::new(alerts.clone()));
        TestApp {
            backend,
            alerts,
            app,
        }
    }

    /// Registers and signs in `email`, returning the user.
    pub(crate) async fn signed_in(test: &TestApp, email: &str) -> AuthUser {
        test.backend
            .sign_up(email, "secret-pass")
            .await
            .expect("sign up");
        test.backend
            .sign_in_with_password(email, "secret-pass")
            .await
            .expect("sign in")
            .user
    }

    #[tokio::test]
    async fn current_profile_is_the_signed_in_row() {
        let test = test_app();
        let user = signed_in(&test, "ada@example.com").await;
        let profile = test
            .app
            .current_profile()
            .await
            .expect("resolves")
            .expect("profile row");
        assert_eq!(profile.id, user.id);
        assert_eq!(profile.username.as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn shutdown_tears_down_open_scopes() {
        let test = test_app();
        let first = test.app.open_scope("inbox");
        let second = test.app.open_scope("chat");
        second.teardown();
        assert_eq!(test.app.live_scopes(), 1);

        assert_eq!(test.app.shutdown().await, 1);
        assert!(!first.is_active());
        assert_eq!(test.app.live_scopes(), 0);
    }

    #[test]
    fn memory_mode_builds_without_network() {
        let app = AppContext::from_config(ClientConfig::memory()).expect("memory backend");
        assert_eq!(app.page_size(), 20);
    }
}

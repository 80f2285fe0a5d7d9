//! Wallet bootstrap, portfolio and transaction history.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::backend::{Backend, Filter, Select, decode_row, decode_rows, fetch_optional, object};
use crate::config::WalletConfig;
use crate::error::{BackendError, SyncError, SyncResult};
use crate::identity::{generate_wallet_address, normalize_currency};
use crate::models::{PortfolioItem, Transaction, Wallet};

const WALLETS: &str = "wallets";
const TRANSACTIONS: &str = "transactions";
const PORTFOLIO: &str = "cryptoPortfolio";

/// Held assets, largest balance first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Portfolio {
    pub items: Vec<PortfolioItem>,
    pub total_balance: f64,
}

impl Portfolio {
    fn from_items(mut items: Vec<PortfolioItem>) -> Self {
        items.sort_by(|a, b| b.balance.total_cmp(&a.balance));
        let total_balance = items.iter().map(|item| item.balance).sum();
        Self {
            items,
            total_balance,
        }
    }
}

pub struct WalletService {
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    config: WalletConfig,
}

impl WalletService {
    pub fn new(backend: Arc<dyn Backend>, alerts: Arc<dyn AlertSink>, config: WalletConfig) -> Self {
        assert!(
            config.bootstrap_attempts >= 1,
            "Wallet bootstrap needs at least one attempt"
        );
        Self {
            backend,
            alerts,
            config,
        }
    }

    fn report<T>(&self, operation: &str, err: SyncError) -> SyncResult<T> {
        warn!("Wallet {operation} failed: {err}");
        self.alerts.alert(Alert::from_error(&err));
        Err(err)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base() * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Returns the user's wallet, creating a zero-balance one when none
    /// exists. Transient insert failures are retried with exponential
    /// backoff up to the configured attempt count.
    ///
    /// Not idempotent: two concurrent bootstraps for one user can both miss
    /// the lookup and insert two wallets.
    pub async fn bootstrap(&self, user_id: &str) -> SyncResult<Wallet> {
        assert!(!user_id.is_empty(), "User id cannot be empty");
        let lookup = Select::from(WALLETS)
            .eq("user_id", user_id)
            .order("created_at", true);
        match fetch_optional(self.backend.as_ref(), lookup).await {
            Ok(Some(row)) => return decode_row(WALLETS, row),
            Ok(None) => debug!("No wallet for {user_id}; creating one"),
            Err(err) => return self.report("lookup", err.into()),
        }

        let currency = match normalize_currency(&self.config.default_currency) {
            Ok(currency) => currency,
            Err(err) => return self.report("bootstrap", err),
        };
        let attempts = self.config.bootstrap_attempts;
        let mut last: Option<BackendError> = None;
        for attempt in 1..=attempts {
            let row = object(json!({
                "user_id": user_id,
                "address": generate_wallet_address(),
                "balance": 0,
                "currency": currency,
            }));
            match self.backend.insert(WALLETS, vec![row]).await {
                Ok(rows) => {
                    let Some(row) = rows.into_iter().next() else {
                        return self.report("bootstrap", BackendError::no_rows(WALLETS).into());
                    };
                    let wallet: Wallet = decode_row(WALLETS, row)?;
                    info!("Created wallet {} for {user_id} on attempt {attempt}", wallet.address);
                    return Ok(wallet);
                }
                Err(err) if err.is_transient() => {
                    warn!("Wallet insert attempt {attempt}/{attempts} failed: {err}");
                    last = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
                Err(err) => return self.report("bootstrap", err.into()),
            }
        }
        let last = last.unwrap_or_else(|| BackendError::new("wallet insert never attempted"));
        self.report("bootstrap", SyncError::BootstrapExhausted { attempts, last })
    }

    pub async fn portfolio(&self) -> SyncResult<Portfolio> {
        let rows = match self.backend.select(&Select::from(PORTFOLIO)).await {
            Ok(rows) => rows,
            Err(err) if err.is_no_rows() => Vec::new(),
            Err(err) => return self.report("portfolio", err.into()),
        };
        let items: Vec<PortfolioItem> = decode_rows(PORTFOLIO, rows)?;
        Ok(Portfolio::from_items(items))
    }

    /// Transfers sent from or received by `wallet_id`, newest first.
    pub async fn transactions(&self, wallet_id: &str) -> SyncResult<Vec<Transaction>> {
        let query = Select::from(TRANSACTIONS)
            .filter(Filter::Or(vec![
                Filter::eq("wallet_id", wallet_id),
                Filter::eq("recipient_wallet_id", wallet_id),
            ]))
            .order("created_at", false)
            .order("id", false);
        let rows = match self.backend.select(&query).await {
            Ok(rows) => rows,
            Err(err) if err.is_no_rows() => Vec::new(),
            Err(err) => return self.report("transactions", err.into()),
        };
        decode_rows(TRANSACTIONS, rows)
    }

    pub async fn update_currency(&self, wallet_id: &str, currency: &str) -> SyncResult<Wallet> {
        let currency = match normalize_currency(currency) {
            Ok(currency) => currency,
            Err(err) => return self.report("currency update", err),
        };
        let rows = match self
            .backend
            .update(
                WALLETS,
                object(json!({ "currency": currency })),
                &[Filter::eq("id", wallet_id)],
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => return self.report("currency update", err.into()),
        };
        match rows.into_iter().next() {
            Some(row) => decode_row(WALLETS, row),
            None => self.report("currency update", BackendError::no_rows(WALLETS).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLog;
    use crate::backend::memory::{MemoryBackend, Op};
    use crate::identity::decode_wallet_address;
    use crate::models::TransactionDirection;

    fn service() -> (MemoryBackend, AlertLog, WalletService) {
        let backend = MemoryBackend::new();
        let alerts = AlertLog::new();
        let config = WalletConfig {
            backoff_base_ms: 1,
            ..WalletConfig::default()
        };
        let service = WalletService::new(Arc::new(backend.clone()), Arc::new(alerts.clone()), config);
        (backend, alerts, service)
    }

    #[tokio::test]
    async fn bootstrap_creates_exactly_one_wallet() {
        let (backend, alerts, service) = service();
        let wallet = service.bootstrap("u1").await.expect("created");
        assert_eq!(wallet.balance, 0.0);
        assert_eq!(wallet.currency, "USD");
        assert!(decode_wallet_address(&wallet.address).is_ok());

        let again = service.bootstrap("u1").await.expect("found");
        assert_eq!(again.id, wallet.id);
        assert_eq!(backend.rows(WALLETS).len(), 1);
        assert_eq!(backend.request_count(WALLETS, Op::Insert), 1);
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (backend, _alerts, service) = service();
        backend.fail_next(WALLETS, Op::Insert, BackendError::new("connection reset"));
        backend.fail_next(WALLETS, Op::Insert, BackendError::new("busy").with_status(503));
        service.bootstrap("u1").await.expect("third attempt succeeds");
        assert_eq!(backend.request_count(WALLETS, Op::Insert), 3);
        assert_eq!(backend.rows(WALLETS).len(), 1);
    }

    #[tokio::test]
    async fn retries_stop_after_three_attempts() {
        let (backend, alerts, service) = service();
        for _ in 0..4 {
            backend.fail_next(WALLETS, Op::Insert, BackendError::new("timeout").with_status(504));
        }
        let err = service.bootstrap("u1").await.expect_err("exhausted");
        assert!(matches!(err, SyncError::BootstrapExhausted { attempts: 3, .. }));
        assert_eq!(backend.request_count(WALLETS, Op::Insert), 3);
        assert!(backend.rows(WALLETS).is_empty());
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (backend, alerts, service) = service();
        backend.fail_next(
            WALLETS,
            Op::Insert,
            BackendError::new("new row violates row-level security policy")
                .with_code("42501")
                .with_status(403),
        );
        assert!(service.bootstrap("u1").await.is_err());
        assert_eq!(backend.request_count(WALLETS, Op::Insert), 1);
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn backoff_doubles() {
        let (_backend, _alerts, service) = service();
        assert_eq!(service.backoff(1), Duration::from_millis(1));
        assert_eq!(service.backoff(2), Duration::from_millis(2));
        assert_eq!(service.backoff(3), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn portfolio_sorts_by_balance_and_totals() {
        let (backend, _alerts, service) = service();
        backend.seed(
            PORTFOLIO,
            [
                object(json!({ "symbol": "ETH", "name": "Ether", "balance": "120.5" })),
                object(json!({ "symbol": "BTC", "name": "Bitcoin", "balance": 900 })),
                object(json!({ "symbol": "DOGE", "name": "Dogecoin", "balance": null })),
            ],
        );
        let portfolio = service.portfolio().await.expect("portfolio");
        let symbols: Vec<_> = portfolio.items.iter().map(|item| item.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTC", "ETH", "DOGE"]);
        assert_eq!(portfolio.total_balance, 1020.5);
    }

    #[tokio::test]
    async fn transactions_cover_both_directions() {
        let (backend, _alerts, service) = service();
        backend.seed(
            TRANSACTIONS,
            [
                object(json!({ "wallet_id": "w1", "recipient_wallet_id": "w2", "amount": 5 })),
                object(json!({ "wallet_id": "w3", "recipient_wallet_id": "w1", "amount": "2.5" })),
                object(json!({ "wallet_id": "w3", "recipient_wallet_id": "w2", "amount": 1 })),
            ],
        );
        let history = service.transactions("w1").await.expect("history");
        let directions: Vec<_> = history.iter().map(|tx| tx.direction("w1")).collect();
        assert_eq!(
            directions,
            vec![TransactionDirection::Received, TransactionDirection::Sent]
        );
    }

    #[tokio::test]
    async fn currency_updates_are_normalized() {
        let (_backend, alerts, service) = service();
        let wallet = service.bootstrap("u1").await.expect("created");
        let updated = service
            .update_currency(&wallet.id, " eur ")
            .await
            .expect("updated");
        assert_eq!(updated.currency, "EUR");
        assert!(service.update_currency(&wallet.id, "€").await.is_err());
        assert_eq!(alerts.len(), 1);
    }
}

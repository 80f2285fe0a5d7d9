use anyhow::{Context, Result};
use onesocial::AppContext;
use onesocial::chat::InboxScreen;
use onesocial::config::{BackendMode, ClientConfig};
use onesocial::notifications::NotificationsScreen;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ClientConfig::load().context("Failed to load configuration")?;
    let app = AppContext::from_config(config)?;

    sign_in(&app).await?;
    app.session().set_foreground(true).await;
    let user = app
        .session()
        .require_user()
        .await
        .context("No authenticated user after sign-in")?;

    let wallet = app
        .wallets()
        .bootstrap(&user.id)
        .await
        .context("Wallet bootstrap failed")?;
    info!("Wallet {} holds {} {}", wallet.address, wallet.balance, wallet.currency);

    let inbox = InboxScreen::mount(&app)
        .await
        .context("Failed to mount inbox")?;
    let notifications = NotificationsScreen::mount(&app)
        .await
        .context("Failed to mount notifications")?;
    app.session().watch_auth(inbox.scope());
    info!(
        "Synced {} rooms ({} unread) and {} notifications ({} unread)",
        inbox.rooms().len(),
        inbox.total_unread(),
        notifications.notifications().len(),
        notifications.unread_count()
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let signal_handle = tokio::spawn(shutdown_signal(shutdown_tx));

    let mut rooms = inbox.rooms().revisions();
    let mut alerts = notifications.notifications().revisions();
    let mut identity = app.session().watch();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            changed = rooms.changed() => {
                if changed.is_err() {
                    warn!("Inbox closed");
                    break;
                }
                info!(
                    "Inbox: {} rooms, {} unread, channel {:?}",
                    inbox.rooms().len(),
                    inbox.total_unread(),
                    inbox.rooms().channel_status()
                );
            }
            changed = alerts.changed() => {
                if changed.is_err() {
                    warn!("Notifications closed");
                    break;
                }
                info!(
                    "Notifications: {} held, {} unread",
                    notifications.notifications().len(),
                    notifications.unread_count()
                );
            }
            changed = identity.changed() => {
                if changed.is_err() || identity.borrow_and_update().is_none() {
                    warn!("Signed out; stopping sync");
                    break;
                }
            }
        }
    }

    drop(inbox);
    drop(notifications);
    app.shutdown().await;
    signal_handle.abort();
    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

/// Signs in with `ONESOCIAL_EMAIL` / `ONESOCIAL_PASSWORD`. The in-memory
/// backend starts empty, so the account is registered first there.
async fn sign_in(app: &AppContext) -> Result<()> {
    let email = std::env::var("ONESOCIAL_EMAIL").context("ONESOCIAL_EMAIL must be set")?;
    let password =
        std::env::var("ONESOCIAL_PASSWORD").context("ONESOCIAL_PASSWORD must be set")?;

    if app.config().backend.mode == BackendMode::Memory {
        app.auth()
            .sign_up(&email, &password, &password)
            .await
            .context("Failed to register offline account")?;
    }
    let session = app
        .auth()
        .sign_in(&email, &password)
        .await
        .context("Sign-in failed")?;
    info!("Signed in as {}", session.user.id);
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    shutdown_tx.send(true).ok();
    info!("Shutdown signal dispatched");
}

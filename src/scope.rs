//! Lifetime of a mounted screen.
//!
//! Every request a screen issues runs through [`ScreenScope::guard`], every
//! background task through [`ScreenScope::spawn`], and every realtime channel
//! is owned by the scope. Teardown happens once: results that land afterwards
//! are dropped and every channel is released.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::{ChannelEvent, ChannelHandle, Subscription};
use crate::error::{SyncError, SyncResult};

pub struct ScreenScope {
    name: String,
    cancel_tx: watch::Sender<bool>,
    owned: Mutex<Owned>,
}

#[derive(Default)]
struct Owned {
    channels: Vec<ChannelHandle>,
    tasks: Vec<JoinHandle<()>>,
    torn_down: bool,
}

/// Cancellation signal handed to tasks that outlive a single call.
#[derive(Clone)]
pub struct ScopeToken {
    rx: watch::Receiver<bool>,
}

impl ScopeToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ScreenScope {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "Scope name cannot be empty");
        let (cancel_tx, _) = watch::channel(false);
        debug!("Screen scope {name} mounted");
        Self {
            name,
            cancel_tx,
            owned: Mutex::new(Owned::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        !*self.cancel_tx.borrow()
    }

    pub fn token(&self) -> ScopeToken {
        ScopeToken {
            rx: self.cancel_tx.subscribe(),
        }
    }

    /// Runs `request` unless the scope is torn down first. A result that
    /// completes after teardown is discarded as `Cancelled`.
    pub async fn guard<F, T>(&self, request: F) -> SyncResult<T>
    where
        F: Future<Output = T>,
    {
        let mut token = self.token();
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            output = request => {
                if token.is_cancelled() {
                    Err(SyncError::Cancelled)
                } else {
                    Ok(output)
                }
            }
        }
    }

    /// Runs a background task until it finishes or the scope is torn down.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut owned = self.owned.lock();
        if owned.torn_down {
            debug!("Scope {} already torn down; task not started", self.name);
            return;
        }
        let mut token = self.token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
        owned.tasks.retain(|task| !task.is_finished());
        owned.tasks.push(handle);
    }

    /// Takes ownership of a channel's release handle and returns its event
    /// stream. A channel adopted after teardown is released immediately.
    pub fn adopt(&self, subscription: Subscription) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (events, handle) = subscription.into_parts();
        let mut owned = self.owned.lock();
        if owned.torn_down {
            drop(owned);
            handle.release();
        } else {
            owned.channels.push(handle);
        }
        events
    }

    pub fn live_channels(&self) -> usize {
        self.owned.lock().channels.len()
    }

    /// Cancels pending work and releases every owned channel. Returns `false`
    /// when the scope was already torn down.
    pub fn teardown(&self) -> bool {
        let (channels, tasks) = {
            let mut owned = self.owned.lock();
            if owned.torn_down {
                return false;
            }
            owned.torn_down = true;
            (
                std::mem::take(&mut owned.channels),
                std::mem::take(&mut owned.tasks),
            )
        };
        self.cancel_tx.send_replace(true);
        for task in &tasks {
            task.abort();
        }
        let released = channels.len();
        for channel in channels {
            channel.release();
        }
        debug!(
            "Screen scope {} torn down ({released} channels, {} tasks)",
            self.name,
            tasks.len()
        );
        true
    }
}

impl Drop for ScreenScope {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counted(name: &str, counter: &Arc<AtomicUsize>) -> Subscription {
        let counter = Arc::clone(counter);
        let (_tx, rx) = mpsc::unbounded_channel();
        Subscription::new(name, rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn guard_passes_results_while_active() {
        let scope = ScreenScope::new("feed");
        let value = scope.guard(async { 7 }).await.expect("active scope");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn guard_drops_results_after_teardown() {
        let scope = Arc::new(ScreenScope::new("chat"));
        let pending = {
            let scope = Arc::clone(&scope);
            tokio::spawn(async move {
                scope
                    .guard(tokio::time::sleep(Duration::from_secs(30)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        scope.teardown();

        let outcome = pending.await.expect("task joins");
        assert!(matches!(outcome, Err(SyncError::Cancelled)));
        assert!(matches!(
            scope.guard(async {}).await,
            Err(SyncError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn teardown_releases_each_channel_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let scope = ScreenScope::new("inbox");
        let _rooms = scope.adopt(counted("rooms", &released));
        let _messages = scope.adopt(counted("messages", &released));
        assert_eq!(scope.live_channels(), 2);

        assert!(scope.teardown());
        assert!(!scope.teardown());
        drop(scope);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn adopting_after_teardown_releases_immediately() {
        let released = Arc::new(AtomicUsize::new(0));
        let scope = ScreenScope::new("late");
        scope.teardown();
        let _events = scope.adopt(counted("late", &released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(scope.live_channels(), 0);
    }

    #[tokio::test]
    async fn spawned_tasks_stop_on_teardown() {
        let scope = ScreenScope::new("pump");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        scope.spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        scope.teardown();
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen > 0);
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}

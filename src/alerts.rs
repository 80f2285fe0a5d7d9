use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::SyncError;

/// A user-visible alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub message: String,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        let title = title.into();
        assert!(!title.is_empty(), "Alert title cannot be empty");
        Self {
            title,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn from_error(err: &SyncError) -> Self {
        match err {
            SyncError::SessionExpired => Self::new("Session expired", "Please sign in again."),
            other => Self::error(other.user_message()),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Writes alerts to the log; the headless default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn alert(&self, alert: Alert) {
        warn!("Alert [{}]: {}", alert.title, alert.message);
    }
}

/// Collects alerts for a UI shell to drain.
#[derive(Debug, Default, Clone)]
pub struct AlertLog {
    entries: Arc<Mutex<Vec<Alert>>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.entries.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|alert| alert.message.clone())
            .collect()
    }

    pub fn drain(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AlertSink for AlertLog {
    fn alert(&self, alert: Alert) {
        warn!("Alert [{}]: {}", alert.title, alert.message);
        self.entries.lock().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    #[test]
    fn backend_errors_alert_with_their_message() {
        let log = AlertLog::new();
        let err = SyncError::from(BackendError::new("permission denied").with_code("42501"));
        log.alert(Alert::from_error(&err));

        assert_eq!(log.messages(), vec!["permission denied".to_string()]);
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn session_expiry_has_its_own_title() {
        let alert = Alert::from_error(&SyncError::SessionExpired);
        assert_eq!(alert.title, "Session expired");
    }
}

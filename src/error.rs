use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Backend error code for a single-row read that matched nothing.
pub const NO_ROWS_CODE: &str = "PGRST116";

/// Auth error code for a call that needs a session when none is held.
pub const SESSION_MISSING_CODE: &str = "session_missing";

/// Error reported by the hosted backend or by the transport in front of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        assert!(!message.is_empty(), "Backend error message cannot be empty");
        Self {
            message,
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn no_rows(table: &str) -> Self {
        Self::new(format!("no rows returned from {table}")).with_code(NO_ROWS_CODE)
    }

    pub fn session_missing() -> Self {
        Self::new("Auth session missing").with_code(SESSION_MISSING_CODE)
    }

    /// Transport failure with no response from the server.
    pub fn transport(err: impl fmt::Display) -> Self {
        Self::new(format!("network error: {err}"))
    }

    pub fn is_no_rows(&self) -> bool {
        self.code.as_deref() == Some(NO_ROWS_CODE)
    }

    pub fn is_session_missing(&self) -> bool {
        self.code.as_deref() == Some(SESSION_MISSING_CODE)
    }

    pub fn is_session_expired(&self) -> bool {
        if self.status == Some(401) {
            return true;
        }
        let lowered = self.message.to_ascii_lowercase();
        lowered.contains("token is expired") || lowered.contains("jwt expired")
    }

    pub fn is_transient(&self) -> bool {
        match self.status {
            None => self.code.is_none(),
            Some(status) => status == 408 || status == 429 || status >= 500,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// Error body shapes returned by the table, auth and storage APIs.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<String>,
}

impl ErrorBody {
    pub(crate) fn into_error(self, status: u16) -> BackendError {
        let message = self
            .message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("request failed with status {status}"));
        let code = self.error_code.or_else(|| match self.code {
            Some(serde_json::Value::String(code)) => Some(code),
            Some(serde_json::Value::Number(code)) => Some(code.to_string()),
            _ => None,
        });
        let mut error = BackendError::new(message).with_status(status);
        error.code = code;
        error
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no authenticated user")]
    NotAuthenticated,
    #[error("session expired, sign in again")]
    SessionExpired,
    #[error("operation cancelled because its screen was torn down")]
    Cancelled,
    #[error("{operation} timed out after {}ms", after.as_millis())]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },
    #[error("another {operation} is already in flight for {key}")]
    Busy { operation: &'static str, key: String },
    #[error("wallet bootstrap gave up after {attempts} attempts: {last}")]
    BootstrapExhausted { attempts: u32, last: BackendError },
    #[error("{0}")]
    Validation(String),
    #[error("failed to decode {table} row: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    /// Text shown to the user when this error is surfaced as an alert.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Backend(err) => err.message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, SyncError::Backend(err) if err.is_no_rows())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

//! Sign-in, sign-up, password reset and sign-out.

use std::sync::Arc;

use tracing::{info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::backend::{AuthSession, AuthUser, Backend};
use crate::error::{SyncError, SyncResult};
use crate::identity::{canonicalize_email, validate_password};

pub const PASSWORDS_DO_NOT_MATCH: &str = "Passwords do not match";
pub const RESET_EMAIL_SENT: &str = "Password reset email sent! Check your inbox.";

pub struct AuthFlows {
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
}

impl AuthFlows {
    pub fn new(backend: Arc<dyn Backend>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { backend, alerts }
    }

    fn fail<T>(&self, err: SyncError) -> SyncResult<T> {
        self.alerts.alert(Alert::from_error(&err));
        Err(err)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> SyncResult<AuthSession> {
        if email.trim().is_empty() || password.is_empty() {
            return self.fail(SyncError::Validation(
                "Please enter your email and password".to_string(),
            ));
        }
        let email = match canonicalize_email(email) {
            Ok(email) => email,
            Err(err) => return self.fail(err),
        };
        match self.backend.sign_in_with_password(&email, password).await {
            Ok(session) => {
                info!("Signed in as {}", session.user.id);
                Ok(session)
            }
            Err(err) => {
                warn!("Sign-in failed for {email}: {err}");
                self.fail(err.into())
            }
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        confirm: &str,
    ) -> SyncResult<AuthUser> {
        if email.trim().is_empty() || password.is_empty() || confirm.is_empty() {
            return self.fail(SyncError::Validation("Please fill in all fields".to_string()));
        }
        if password != confirm {
            return self.fail(SyncError::Validation(PASSWORDS_DO_NOT_MATCH.to_string()));
        }
        let checked = canonicalize_email(email).and_then(|email| {
            validate_password(password)?;
            Ok(email)
        });
        let email = match checked {
            Ok(email) => email,
            Err(err) => return self.fail(err),
        };
        match self.backend.sign_up(&email, password).await {
            Ok(user) => {
                info!("Registered {}", user.id);
                Ok(user)
            }
            Err(err) => {
                warn!("Sign-up failed for {email}: {err}");
                self.fail(err.into())
            }
        }
    }

    /// Sends a reset link; returns the confirmation shown to the user.
    pub async fn reset_password(&self, email: &str) -> SyncResult<&'static str> {
        let email = match canonicalize_email(email) {
            Ok(email) => email,
            Err(_) if email.trim().is_empty() => {
                return self.fail(SyncError::Validation(
                    "Please enter your email address".to_string(),
                ));
            }
            Err(err) => return self.fail(err),
        };
        match self.backend.reset_password_for_email(&email).await {
            Ok(()) => {
                self.alerts.alert(Alert::new("Success", RESET_EMAIL_SENT));
                Ok(RESET_EMAIL_SENT)
            }
            Err(err) => self.fail(err.into()),
        }
    }

    pub async fn sign_out(&self) -> SyncResult<()> {
        match self.backend.sign_out().await {
            Ok(()) => {
                info!("Signed out");
                Ok(())
            }
            Err(err) => self.fail(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLog;
    use crate::backend::memory::{MemoryBackend, Op};

    fn flows() -> (MemoryBackend, AlertLog, AuthFlows) {
        let backend = MemoryBackend::new();
        let alerts = AlertLog::new();
        let flows = AuthFlows::new(Arc::new(backend.clone()), Arc::new(alerts.clone()));
        (backend, alerts, flows)
    }

    #[tokio::test]
    async fn mismatched_confirmation_never_reaches_backend() {
        let (backend, alerts, flows) = flows();
        let err = flows
            .sign_up("ada@example.com", "secret1", "secret2")
            .await
            .expect_err("rejected");
        assert_eq!(err.user_message(), PASSWORDS_DO_NOT_MATCH);
        assert_eq!(alerts.messages(), vec![PASSWORDS_DO_NOT_MATCH.to_string()]);
        assert_eq!(backend.request_count("auth", Op::SignUp), 0);
    }

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let (_backend, alerts, flows) = flows();
        let user = flows
            .sign_up(" Ada@Example.com", "secret1", "secret1")
            .await
            .expect("registered");
        let session = flows
            .sign_in("ada@example.com", "secret1")
            .await
            .expect("signed in");
        assert_eq!(session.user, user);
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn backend_rejections_surface_their_message() {
        let (_backend, alerts, flows) = flows();
        let err = flows
            .sign_in("nobody@example.com", "whatever")
            .await
            .expect_err("unknown account");
        assert_eq!(err.user_message(), "Invalid login credentials");
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn empty_fields_are_rejected_locally() {
        let (backend, alerts, flows) = flows();
        assert!(flows.sign_in("", "").await.is_err());
        assert!(flows.sign_up("a@b.co", "", "").await.is_err());
        assert_eq!(alerts.len(), 2);
        assert_eq!(backend.request_count("auth", Op::SignIn), 0);
    }

    #[tokio::test]
    async fn reset_password_confirms() {
        let (backend, alerts, flows) = flows();
        let message = flows
            .reset_password("ada@example.com")
            .await
            .expect("sent");
        assert_eq!(message, RESET_EMAIL_SENT);
        assert_eq!(backend.password_resets(), vec!["ada@example.com".to_string()]);
        assert_eq!(alerts.snapshot()[0].title, "Success");
    }
}

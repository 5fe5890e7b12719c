//! Outbound notification port
//!
//! Delivery itself (SMTP, SMS) happens elsewhere. A failed delivery never
//! rolls back the token it was carrying.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_password_reset_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> Result<(), NotifyError>;

    async fn send_otp_password_reset_email(
        &self,
        email: &str,
        name: &str,
        otp: &str,
    ) -> Result<(), NotifyError>;

    /// Tells the user their address could not be reached and should be updated
    async fn send_email_update_notification(&self, email: &str, name: &str)
        -> Result<(), NotifyError>;

    async fn send_verification_email(
        &self,
        email: &str,
        name: &str,
        token: &str,
    ) -> Result<(), NotifyError>;
}

/// Records notifications in the log instead of sending them.
/// Token values are never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_password_reset_email(
        &self,
        email: &str,
        _name: &str,
        _token: &str,
    ) -> Result<(), NotifyError> {
        info!(target: "notify", email = %email, kind = "password_reset", "Notification queued");
        Ok(())
    }

    async fn send_otp_password_reset_email(
        &self,
        email: &str,
        _name: &str,
        _otp: &str,
    ) -> Result<(), NotifyError> {
        info!(target: "notify", email = %email, kind = "password_reset_otp", "Notification queued");
        Ok(())
    }

    async fn send_email_update_notification(
        &self,
        email: &str,
        _name: &str,
    ) -> Result<(), NotifyError> {
        info!(target: "notify", email = %email, kind = "email_update", "Notification queued");
        Ok(())
    }

    async fn send_verification_email(
        &self,
        email: &str,
        _name: &str,
        _token: &str,
    ) -> Result<(), NotifyError> {
        info!(target: "notify", email = %email, kind = "email_verification", "Notification queued");
        Ok(())
    }
}

/// Captures outgoing messages so tests can read the tokens back
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<SentNotification>>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub kind: &'static str,
    pub email: String,
    pub secret: Option<String>,
}

#[cfg(any(test, feature = "test-utils"))]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following delivery fail (after being recorded)
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Secret carried by the most recent message of `kind` to `email`
    pub fn last_secret(&self, kind: &str, email: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|n| n.kind == kind && n.email == email)
            .and_then(|n| n.secret)
    }

    fn record(&self, kind: &'static str, email: &str, secret: Option<&str>) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentNotification {
                kind,
                email: email.to_string(),
                secret: secret.map(str::to_string),
            });
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError("mailbox unreachable".to_string()));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_password_reset_email(
        &self,
        email: &str,
        _name: &str,
        token: &str,
    ) -> Result<(), NotifyError> {
        self.record("password_reset", email, Some(token))
    }

    async fn send_otp_password_reset_email(
        &self,
        email: &str,
        _name: &str,
        otp: &str,
    ) -> Result<(), NotifyError> {
        self.record("password_reset_otp", email, Some(otp))
    }

    async fn send_email_update_notification(
        &self,
        email: &str,
        _name: &str,
    ) -> Result<(), NotifyError> {
        // Fallback channel; recorded but never fails
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentNotification {
                kind: "email_update",
                email: email.to_string(),
                secret: None,
            });
        Ok(())
    }

    async fn send_verification_email(
        &self,
        email: &str,
        _name: &str,
        token: &str,
    ) -> Result<(), NotifyError> {
        self.record("email_verification", email, Some(token))
    }
}

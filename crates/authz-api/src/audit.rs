//! Security audit trail
//!
//! Every identity decision worth reconstructing later (logins, token
//! lifecycle, permission denials, role changes) is emitted as one structured
//! event on the `audit` tracing target, so it can be routed apart from
//! application logs.
//!
//! Events never carry raw tokens, password hashes or OTP codes.
//!
//! Author: hephaex@gmail.com

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    LoginSuccess {
        user_id: Uuid,
        tenant_id: Uuid,
        org_id: Option<Uuid>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    /// `reason` is internal; callers only ever see a generic failure
    LoginFailure {
        email: String,
        tenant_id: Uuid,
        reason: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    Logout {
        user_id: Uuid,
        refresh_revoked: bool,
    },

    TokenRefresh {
        user_id: Uuid,
        org_id: Option<Uuid>,
    },

    RegistrationSuccess {
        user_id: Uuid,
        tenant_id: Uuid,
        role: String,
    },

    OrganizationRegistered {
        user_id: Uuid,
        tenant_id: Uuid,
        org_id: Uuid,
        ip_address: Option<String>,
    },

    RegistrationFailure {
        email: String,
        tenant_id: Uuid,
        reason: String,
    },

    PasswordResetRequested {
        user_id: Uuid,
        channel: String,
    },

    PasswordChange {
        user_id: Uuid,
        sessions_revoked: u64,
    },

    EmailVerified {
        user_id: Uuid,
    },

    SessionsInvalidated {
        user_id: Uuid,
        sessions: u64,
        refresh_tokens: u64,
    },

    OrganizationSwitch {
        user_id: Uuid,
        from_org: Option<Uuid>,
        to_org: Uuid,
    },

    /// Authenticated caller lacking every permission the operation accepts
    PermissionDenied {
        user_id: Uuid,
        operation: String,
        required: Vec<String>,
        ip_address: Option<String>,
    },

    InvalidToken {
        operation: String,
        reason: String,
        ip_address: Option<String>,
    },

    RoleCreated {
        role_id: Uuid,
        tenant_id: Uuid,
        org_id: Option<Uuid>,
        name: String,
        actor: Uuid,
    },

    RolePermissionGranted {
        role_id: Uuid,
        permission: String,
        actor: Uuid,
    },

    RoleAssigned {
        user_id: Uuid,
        role_id: Uuid,
        org_id: Option<Uuid>,
        actor: Uuid,
    },

    UserDeactivated {
        user_id: Uuid,
        actor: Option<Uuid>,
    },
}

impl AuditEvent {
    /// The user the event is about, when there is one
    pub fn subject(&self) -> Option<Uuid> {
        match self {
            Self::LoginSuccess { user_id, .. }
            | Self::Logout { user_id, .. }
            | Self::TokenRefresh { user_id, .. }
            | Self::RegistrationSuccess { user_id, .. }
            | Self::OrganizationRegistered { user_id, .. }
            | Self::PasswordResetRequested { user_id, .. }
            | Self::PasswordChange { user_id, .. }
            | Self::EmailVerified { user_id }
            | Self::SessionsInvalidated { user_id, .. }
            | Self::OrganizationSwitch { user_id, .. }
            | Self::PermissionDenied { user_id, .. }
            | Self::RoleAssigned { user_id, .. }
            | Self::UserDeactivated { user_id, .. } => Some(*user_id),
            Self::LoginFailure { .. }
            | Self::RegistrationFailure { .. }
            | Self::InvalidToken { .. }
            | Self::RoleCreated { .. }
            | Self::RolePermissionGranted { .. } => None,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::LoginSuccess { .. } => "Login successful",
            Self::LoginFailure { .. } => "Login failed",
            Self::Logout { .. } => "User logout",
            Self::TokenRefresh { .. } => "Session refreshed",
            Self::RegistrationSuccess { .. } => "Registration successful",
            Self::OrganizationRegistered { .. } => "Organization registered",
            Self::RegistrationFailure { .. } => "Registration failed",
            Self::PasswordResetRequested { .. } => "Password reset requested",
            Self::PasswordChange { .. } => "Password changed",
            Self::EmailVerified { .. } => "Email verified",
            Self::SessionsInvalidated { .. } => "All sessions invalidated",
            Self::OrganizationSwitch { .. } => "Organization switched",
            Self::PermissionDenied { .. } => "Permission denied",
            Self::InvalidToken { .. } => "Invalid token",
            Self::RoleCreated { .. } => "Role created",
            Self::RolePermissionGranted { .. } => "Permission granted to role",
            Self::RoleAssigned { .. } => "Role assigned",
            Self::UserDeactivated { .. } => "User deactivated",
        }
    }
}

/// Emit one audit event on the `audit` target
pub fn audit_log(event: &AuditEvent) {
    let timestamp = Utc::now();
    let event_json = serde_json::to_string(event)
        .unwrap_or_else(|e| format!("{{\"error\":\"Failed to serialize audit event: {e}\"}}"));
    let subject = event.subject();

    match event {
        AuditEvent::LoginFailure {
            email,
            reason,
            ip_address,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                reason = %reason,
                ip_address = ?ip_address,
                "{}", event.message()
            );
        }
        AuditEvent::PermissionDenied {
            operation,
            required,
            ip_address,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = ?subject,
                operation = %operation,
                required = ?required,
                ip_address = ?ip_address,
                "{}", event.message()
            );
        }
        AuditEvent::InvalidToken {
            operation,
            reason,
            ip_address,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                operation = %operation,
                reason = %reason,
                ip_address = ?ip_address,
                "{}", event.message()
            );
        }
        _ => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = ?subject,
                "{}", event.message()
            );
        }
    }
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`
pub fn extract_ip_address(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(first.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

pub fn extract_user_agent(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = AuditEvent::PermissionDenied {
            user_id: Uuid::new_v4(),
            operation: "/AuthService/CreateRole".to_string(),
            required: vec!["create-role".to_string()],
            ip_address: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"permission_denied\""));
        assert!(json.contains("create-role"));
    }

    #[test]
    fn test_subject() {
        let user_id = Uuid::new_v4();
        assert_eq!(AuditEvent::EmailVerified { user_id }.subject(), Some(user_id));
        assert_eq!(
            AuditEvent::InvalidToken {
                operation: "/x".into(),
                reason: "expired".into(),
                ip_address: None,
            }
            .subject(),
            None
        );
    }

    #[test]
    fn test_audit_log_does_not_panic() {
        audit_log(&AuditEvent::LoginFailure {
            email: "alice@x.com".to_string(),
            tenant_id: Uuid::new_v4(),
            reason: "unknown email".to_string(),
            ip_address: Some("192.168.1.1".to_string()),
            user_agent: None,
        });
        audit_log(&AuditEvent::SessionsInvalidated {
            user_id: Uuid::new_v4(),
            sessions: 3,
            refresh_tokens: 1,
        });
    }

    #[test]
    fn test_extract_ip_prefers_forwarded_for() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.1, 198.51.100.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());

        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_extract_ip_from_real_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.7".parse().unwrap());

        assert_eq!(extract_ip_address(&headers), Some("203.0.113.7".to_string()));
    }

    #[test]
    fn test_extract_missing_headers() {
        let headers = axum::http::HeaderMap::new();
        assert_eq!(extract_ip_address(&headers), None);
        assert_eq!(extract_user_agent(&headers), None);
    }
}

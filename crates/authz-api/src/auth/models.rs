//! Credential models and request/response payloads
//!
//! Every token kind (session, refresh, password reset, OTP, email
//! verification) is a [`Credential`]: a time-bounded row keyed by the
//! SHA-256 digest of the raw token. Expiry is decided in exactly one place,
//! [`Credential::is_live`].

use authz_core::{Claims, User, UserPublic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// Credentials
// ============================================================================

/// Token kinds sharing the credential lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Session,
    Refresh,
    PasswordReset,
    PasswordResetOtp,
    EmailVerification,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Refresh => "refresh",
            Self::PasswordReset => "password_reset",
            Self::PasswordResetOtp => "password_reset_otp",
            Self::EmailVerification => "email_verification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "refresh" => Some(Self::Refresh),
            "password_reset" => Some(Self::PasswordReset),
            "password_reset_otp" => Some(Self::PasswordResetOtp),
            "email_verification" => Some(Self::EmailVerification),
            _ => None,
        }
    }

    /// Single-use kinds are deleted by the read that accepts them
    pub fn is_single_use(&self) -> bool {
        matches!(
            self,
            Self::PasswordReset | Self::PasswordResetOtp | Self::EmailVerification
        )
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex SHA-256 of a raw token; the only form in which tokens are stored
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One persisted, time-bounded credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub kind: CredentialKind,
    pub token_hash: String,
    pub user_id: Uuid,
    /// Organization the credential was issued for (sessions only)
    pub org_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        kind: CredentialKind,
        raw_token: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        // Saturates instead of overflowing for out-of-range lifetimes
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            kind,
            token_hash: token_digest(raw_token),
            user_id,
            org_id: None,
            created_at: now,
            expires_at,
        }
    }

    pub fn with_org(mut self, org_id: Option<Uuid>) -> Self {
        self.org_id = org_id;
        self
    }

    /// A credential is live strictly before its expiry instant
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Short, non-reversible handle safe to show to the owning user
    pub fn public_id(&self) -> String {
        self.token_hash.chars().take(16).collect()
    }
}

// ============================================================================
// Service results
// ============================================================================

/// Request metadata recorded for audit
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Tokens and claims produced by login, refresh and organization switch
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub session_token: String,
    pub session_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub claims: Claims,
}

/// Result of a public organization sign-up
#[derive(Debug, Clone)]
pub struct OrganizationRegistration {
    pub user: User,
    pub org_id: Uuid,
    pub organization_name: String,
    pub is_super_admin: bool,
    pub grant: AuthGrant,
}

/// Active session as shown to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub org_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Credential> for SessionInfo {
    fn from(credential: &Credential) -> Self {
        Self {
            session_id: credential.public_id(),
            org_id: credential.org_id,
            created_at: credential.created_at,
            expires_at: credential.expires_at,
        }
    }
}

// ============================================================================
// Request payloads
// ============================================================================

/// Adds a user to the caller's own tenant
#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    pub password: String,
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    pub role_name: String,
}

/// Public sign-up creating a tenant, its first organization and a super admin
#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct RegisterOrganizationRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    pub password: String,
    #[validate(length(min = 3, max = 255, message = "Organization name must be 3-255 characters"))]
    pub organization_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct LoginRequest {
    pub tenant_id: Uuid,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub org_id: Option<Uuid>,
}

/// Login without a tenant; the account is found by email alone
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct GlobalLoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub org_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub org_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ValidateTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct ForgotPasswordRequest {
    pub tenant_id: Uuid,
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct OtpResetRequest {
    pub tenant_id: Uuid,
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    #[validate(length(equal = 5, message = "OTP must be 5 digits"))]
    pub otp: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SendVerificationEmailRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct VerifyEmailRequest {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SwitchOrganizationRequest {
    pub org_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub org_id: Option<Uuid>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct GrantPermissionRequest {
    pub role_name: String,
    #[serde(default)]
    pub org_id: Option<Uuid>,
    pub permission: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct AssignRoleRequest {
    pub user_id: Uuid,
    pub role_name: String,
    #[serde(default)]
    pub org_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct DeactivateUserRequest {
    pub user_id: Uuid,
}

// ============================================================================
// Response payloads
// ============================================================================

/// Verified identity as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ClaimsResponse {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub org_id: Option<Uuid>,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl From<Claims> for ClaimsResponse {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.user_id,
            tenant_id: claims.tenant_id,
            org_id: claims.org_id,
            email: claims.email,
            name: claims.name,
            roles: claims.roles,
            permissions: claims.permissions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub session_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Seconds until the session token expires
    pub expires_in: i64,
    pub session_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub claims: ClaimsResponse,
}

impl AuthResponse {
    pub fn from_grant(grant: AuthGrant, now: DateTime<Utc>) -> Self {
        Self {
            expires_in: (grant.session_expires_at - now).num_seconds().max(0),
            session_token: grant.session_token,
            refresh_token: grant.refresh_token,
            token_type: "Bearer".to_string(),
            session_expires_at: grant.session_expires_at,
            refresh_expires_at: grant.refresh_expires_at,
            claims: grant.claims.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegistrationResponse {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: String,
    pub organization_id: Uuid,
    pub organization_name: String,
    pub is_super_admin: bool,
    pub token: String,
    pub refresh_token: String,
    pub session_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub message: String,
}

impl From<OrganizationRegistration> for RegistrationResponse {
    fn from(registration: OrganizationRegistration) -> Self {
        let OrganizationRegistration {
            user,
            org_id,
            organization_name,
            is_super_admin,
            grant,
        } = registration;
        Self {
            user_id: user.id,
            tenant_id: user.tenant_id,
            email: user.email,
            name: user.name,
            organization_id: org_id,
            organization_name,
            is_super_admin,
            token: grant.session_token,
            refresh_token: grant.refresh_token,
            session_expires_at: grant.session_expires_at,
            refresh_expires_at: grant.refresh_expires_at,
            message: "Organization registered".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<UserPublic> for UserResponse {
    fn from(user: UserPublic) -> Self {
        Self {
            id: user.id,
            tenant_id: user.tenant_id,
            name: user.name,
            email: user.email,
            is_active: user.is_active,
            email_verified: user.email_verified,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_liveness_boundary() {
        let now = Utc::now();
        let credential = Credential::new(
            CredentialKind::Session,
            "raw",
            Uuid::new_v4(),
            now,
            Duration::from_secs(60),
        );

        assert!(credential.is_live(now));
        assert!(credential.is_live(credential.expires_at - chrono::Duration::milliseconds(1)));
        assert!(!credential.is_live(credential.expires_at));
        assert!(!credential.is_live(credential.expires_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_credential_never_stores_raw_token() {
        let credential = Credential::new(
            CredentialKind::Refresh,
            "super-secret-token",
            Uuid::new_v4(),
            Utc::now(),
            Duration::from_secs(60),
        );

        assert_ne!(credential.token_hash, "super-secret-token");
        assert_eq!(credential.token_hash.len(), 64);
        assert_eq!(credential.token_hash, token_digest("super-secret-token"));
        assert_eq!(credential.public_id().len(), 16);
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [
            CredentialKind::Session,
            CredentialKind::Refresh,
            CredentialKind::PasswordReset,
            CredentialKind::PasswordResetOtp,
            CredentialKind::EmailVerification,
        ] {
            assert_eq!(CredentialKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CredentialKind::parse("bogus"), None);
    }

    #[test]
    fn test_single_use_kinds() {
        assert!(CredentialKind::PasswordReset.is_single_use());
        assert!(CredentialKind::EmailVerification.is_single_use());
        assert!(!CredentialKind::Session.is_single_use());
        assert!(!CredentialKind::Refresh.is_single_use());
    }

    #[test]
    fn test_register_request_validation() {
        let valid = RegisterRequest {
            name: "Alice".to_string(),
            email: "alice@x.com".to_string(),
            password: "SecureP@ss123".to_string(),
            role_name: "manager".to_string(),
        };
        assert!(valid.validate().is_ok());

        let bad_email = RegisterRequest {
            email: "not-an-email".to_string(),
            ..valid.clone()
        };
        assert!(bad_email.validate().is_err());

        let empty_role = RegisterRequest {
            role_name: String::new(),
            ..valid
        };
        assert!(empty_role.validate().is_err());
    }

    #[test]
    fn test_organization_name_length() {
        let request = RegisterOrganizationRequest {
            name: "Alice".to_string(),
            email: "alice@x.com".to_string(),
            password: "SecureP@ss123".to_string(),
            organization_name: "Acme".to_string(),
        };
        assert!(request.validate().is_ok());

        let short = RegisterOrganizationRequest {
            organization_name: "AB".to_string(),
            ..request.clone()
        };
        assert!(short.validate().is_err());

        let long = RegisterOrganizationRequest {
            organization_name: "x".repeat(256),
            ..request
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_out_of_range_ttl_saturates() {
        let now = Utc::now();
        let credential = Credential::new(
            CredentialKind::Refresh,
            "raw",
            Uuid::new_v4(),
            now,
            Duration::MAX,
        );
        assert_eq!(credential.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(credential.is_live(now));
    }

    #[test]
    fn test_login_request_org_optional() {
        let json = r#"{"tenant_id":"7f1c1a52-6c0c-4a53-9c51-2a0a8b7cbb11","email":"a@x.com","password":"p"}"#;
        let request: LoginRequest = serde_json::from_str(json).unwrap();
        assert!(request.org_id.is_none());
    }
}

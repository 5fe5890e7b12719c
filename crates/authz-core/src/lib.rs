//! Authz Core - Identity domain models, claims, and shared types
//!
//! This crate defines the abstractions shared by every service that sits
//! behind the access interceptor:
//! - Identity models (users, roles, permissions, organizations and memberships)
//! - Verified identity claims attached to each authorized call
//! - The authentication/authorization error taxonomy
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, AuthConfig, ConfigError, DatabaseConfig, LoggingConfig, ServerConfig, StorageBackend,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

/// Role name that satisfies every permission check by default
pub const SUPER_ADMIN_ROLE: &str = "SUPER_ADMIN";

// ============================================================================
// Error Types
// ============================================================================

/// Error taxonomy for identity and access decisions
///
/// Display strings are deliberately generic: they end up in responses and
/// must not distinguish unknown accounts from wrong passwords, or expired
/// tokens from unknown ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,

    /// `required` is for server-side logging only
    #[error("insufficient permissions")]
    PermissionDenied { required: Vec<String> },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("email already registered")]
    DuplicateEmail,

    #[error("invalid input: {0}")]
    WeakInput(String),

    #[error("not found")]
    NotFound,

    #[error("expired")]
    Expired,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("notification delivery failed: {0}")]
    NotificationFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Only storage outages may be retried, and only with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// True for every "this token does not (or no longer) exist" outcome
    pub fn is_token_absent(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired | Self::InvalidToken)
    }

    /// Collapse absent and expired tokens into one externally visible kind
    pub fn normalized(self) -> Self {
        if self.is_token_absent() {
            Self::InvalidToken
        } else {
            self
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

// ============================================================================
// Identity Models
// ============================================================================

/// Canonical form used for email uniqueness within a tenant
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// User account, owned by exactly one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_active: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        tenant_id: Uuid,
        name: impl Into<String>,
        email: &str,
        password_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            email: normalize_email(email),
            password_hash: password_hash.into(),
            is_active: true,
            email_verified_at: None,
            deactivated_at: None,
            deactivated_by: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_email_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }

    /// Public view of the account, without credential material
    pub fn to_public(&self) -> UserPublic {
        UserPublic {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            email: self.email.clone(),
            is_active: self.is_active,
            email_verified: self.is_email_verified(),
            last_login_at: self.last_login_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Named bundle of permissions
///
/// A role with no `org_id` is tenant-wide; otherwise it only contributes
/// permissions while its organization is the one in context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub org_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub permissions: Vec<String>,
    pub is_system_role: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(tenant_id: Uuid, org_id: Option<Uuid>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            org_id,
            name: name.into(),
            description: None,
            permissions: Vec::new(),
            is_system_role: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for permission in permissions {
            self.grant(permission);
        }
        self
    }

    /// Add a permission; returns false if it was already granted
    pub fn grant(&mut self, permission: impl Into<String>) -> bool {
        let permission = permission.into();
        if self.permissions.contains(&permission) {
            return false;
        }
        self.permissions.push(permission);
        self.updated_at = Utc::now();
        true
    }

    pub fn applies_to(&self, org_id: Option<Uuid>) -> bool {
        scope_matches(self.org_id, org_id)
    }
}

/// Catalog entry describing a permission name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

impl Permission {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// User to role join row, optionally limited to one organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub org_id: Option<Uuid>,
    pub assigned_at: DateTime<Utc>,
}

impl RoleAssignment {
    pub fn new(user_id: Uuid, role_id: Uuid, org_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            role_id,
            org_id,
            assigned_at: Utc::now(),
        }
    }

    pub fn applies_to(&self, org_id: Option<Uuid>) -> bool {
        scope_matches(self.org_id, org_id)
    }
}

/// User to organization join row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub tenant_id: Uuid,
    pub is_current: bool,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(user_id: Uuid, org_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            user_id,
            org_id,
            tenant_id,
            is_current: false,
            joined_at: Utc::now(),
        }
    }
}

/// Organization inside a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, created_by: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            created_by,
            created_at: Utc::now(),
        }
    }
}

/// Unscoped rows always apply. Scoped rows apply only while their own
/// organization is in context, never when there is none.
fn scope_matches(row_org: Option<Uuid>, context_org: Option<Uuid>) -> bool {
    match (row_org, context_org) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(row), Some(ctx)) => row == ctx,
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Verified identity of one caller, scoped to a tenant and optionally an
/// organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub org_id: Option<Uuid>,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl Claims {
    /// Build claims from the user's current role state.
    ///
    /// Roles that do not apply to `org_id` are ignored. Role names and
    /// permissions are de-duplicated and sorted.
    pub fn derive(user: &User, org_id: Option<Uuid>, roles: &[Role]) -> Self {
        let mut role_names = BTreeSet::new();
        let mut permissions = BTreeSet::new();

        for role in roles.iter().filter(|r| r.applies_to(org_id)) {
            role_names.insert(role.name.clone());
            permissions.extend(role.permissions.iter().cloned());
        }

        Self {
            user_id: user.id,
            tenant_id: user.tenant_id,
            org_id,
            email: user.email.clone(),
            name: user.name.clone(),
            roles: role_names.into_iter().collect(),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// OR semantics: any single permission from `required` is enough
    pub fn holds_any(&self, required: &BTreeSet<String>) -> bool {
        self.permissions.iter().any(|p| required.contains(p))
    }
}

// ============================================================================
// Tests
// ============================================================================

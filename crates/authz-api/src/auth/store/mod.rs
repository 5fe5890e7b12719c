//! Credential store ports
//!
//! Pure persistence for identity data. Nothing here decides whether a
//! token is live or a caller is allowed anything; that policy lives in the
//! token issuer and identity service.
//!
//! Every method is a single independent statement against the backend,
//! except [`DirectoryStore::register_user`] and
//! [`DirectoryStore::register_organization`], which must be atomic.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use super::models::{Credential, CredentialKind};
use async_trait::async_trait;
use authz_core::{AuthError, Membership, Organization, Permission, Role, RoleAssignment, User};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Record not found")]
    NotFound,

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence for every token kind, keyed by `(kind, token_hash)`
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert one credential; `Conflict` if the key already exists
    async fn insert_credential(&self, credential: Credential) -> Result<(), StoreError>;

    async fn find_credential(
        &self,
        kind: CredentialKind,
        token_hash: &str,
    ) -> Result<Option<Credential>, StoreError>;

    /// Returns true only for the caller that actually removed the row
    async fn delete_credential(
        &self,
        kind: CredentialKind,
        token_hash: &str,
    ) -> Result<bool, StoreError>;

    async fn delete_user_credentials(
        &self,
        kind: CredentialKind,
        user_id: Uuid,
    ) -> Result<u64, StoreError>;

    async fn list_user_credentials(
        &self,
        kind: CredentialKind,
        user_id: Uuid,
    ) -> Result<Vec<Credential>, StoreError>;

    /// Delete every credential whose expiry is at or before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Users, roles, permissions and organization memberships
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    /// `email` must already be normalized
    async fn find_user_by_email(
        &self,
        tenant_id: Uuid,
        email: &str,
    ) -> Result<Option<User>, StoreError>;

    /// Every account with this email in any tenant, oldest first
    async fn find_users_by_email(&self, email: &str) -> Result<Vec<User>, StoreError>;

    /// Insert the user, look up or create the tenant-wide role `role_name`,
    /// and assign it, all or nothing. `Conflict` if the email is taken.
    async fn register_user(&self, user: User, role_name: &str) -> Result<(User, Role), StoreError>;

    /// Create the organization, its first user and the tenant-wide system
    /// role `role_name`, assign the role and make the organization the
    /// user's current one, all or nothing. `Conflict` if the email is
    /// registered in any tenant.
    async fn register_organization(
        &self,
        organization: Organization,
        user: User,
        role_name: &str,
    ) -> Result<(User, Role), StoreError>;

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, StoreError>;

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_login(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn mark_email_verified(&self, user_id: Uuid, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn deactivate_user(
        &self,
        user_id: Uuid,
        actor: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Roles assigned to the user that apply to `org_id`; with `None` only
    /// tenant-wide assignments of tenant-wide roles
    async fn roles_for_user(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<Role>, StoreError>;

    async fn find_role(
        &self,
        tenant_id: Uuid,
        org_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Role>, StoreError>;

    async fn create_role(&self, role: Role) -> Result<Role, StoreError>;

    async fn grant_permission(&self, role_id: Uuid, permission: &str) -> Result<(), StoreError>;

    /// Idempotent
    async fn assign_role(&self, assignment: RoleAssignment) -> Result<(), StoreError>;

    async fn upsert_permission(&self, permission: Permission) -> Result<(), StoreError>;

    async fn list_permissions(&self) -> Result<Vec<Permission>, StoreError>;

    async fn find_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, StoreError>;

    async fn memberships_for_user(&self, user_id: Uuid) -> Result<Vec<Membership>, StoreError>;

    async fn add_membership(&self, membership: Membership) -> Result<(), StoreError>;
}

/// Everything the identity service needs from storage
pub trait IdentityStore: CredentialStore + DirectoryStore {}

impl<T: CredentialStore + DirectoryStore> IdentityStore for T {}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => AuthError::Internal(format!("conflicting {what}")),
            StoreError::NotFound => AuthError::NotFound,
            StoreError::Backend(msg) => AuthError::StorageUnavailable(msg),
        }
    }
}

/// Deadline applied to every store round-trip
///
/// A call that outlives the deadline is dropped and reported as
/// [`AuthError::StorageUnavailable`], the only retryable error kind.
#[derive(Debug, Clone, Copy)]
pub struct StoreGuard {
    timeout: Duration,
}

impl StoreGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.try_call(op, fut).await?.map_err(AuthError::from)
    }

    /// Like [`call`](Self::call), but leaves `Conflict` and `NotFound` for
    /// the caller to interpret
    pub async fn try_call<T, F>(
        &self,
        op: &'static str,
        fut: F,
    ) -> Result<Result<T, StoreError>, AuthError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Credential store call timed out");
                Err(AuthError::StorageUnavailable(format!("{op} timed out")))
            }
            Ok(Err(StoreError::Backend(msg))) => {
                warn!(op, error = %msg, "Credential store call failed");
                Err(AuthError::StorageUnavailable(format!("{op} failed")))
            }
            Ok(result) => Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_times_out() {
        let guard = StoreGuard::new(Duration::from_millis(10));
        let result = guard
            .call("stalled", std::future::pending::<Result<(), StoreError>>())
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, AuthError::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_guard_maps_backend_errors() {
        let guard = StoreGuard::new(Duration::from_secs(1));
        let result = guard
            .call("broken", async {
                Err::<(), _>(StoreError::Backend("connection reset".to_string()))
            })
            .await;
        assert!(matches!(result, Err(AuthError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_try_call_keeps_conflicts() {
        let guard = StoreGuard::new(Duration::from_secs(1));
        let result = guard
            .try_call("insert", async {
                Err::<(), _>(StoreError::Conflict("email".to_string()))
            })
            .await
            .unwrap();
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }
}

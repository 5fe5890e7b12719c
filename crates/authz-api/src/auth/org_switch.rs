//! Organization-switch authorization
//!
//! Decides whether a user may move their working context to another
//! organization and, if so, derives claims scoped to it. Any doubt is a
//! denial; only a storage outage is reported as such so the caller can retry.

use super::store::{DirectoryStore, StoreGuard};
use authz_core::{AuthError, Claims, Result};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct OrgSwitchAuthorizer {
    store: Arc<dyn DirectoryStore>,
    guard: StoreGuard,
}

impl OrgSwitchAuthorizer {
    pub fn new(store: Arc<dyn DirectoryStore>, guard: StoreGuard) -> Self {
        Self { store, guard }
    }

    pub async fn switch_organization(&self, user_id: Uuid, target_org: Uuid) -> Result<Claims> {
        let user = self
            .guard
            .call("find_user", self.store.find_user(user_id))
            .await
            .map_err(fail_closed)?
            .filter(|u| u.is_active)
            .ok_or_else(|| deny(user_id, target_org, "unknown or inactive user"))?;

        let membership = self
            .guard
            .call("find_membership", self.store.find_membership(user_id, target_org))
            .await
            .map_err(fail_closed)?
            .ok_or_else(|| deny(user_id, target_org, "no membership"))?;

        if membership.tenant_id != user.tenant_id {
            return Err(deny(user_id, target_org, "organization belongs to another tenant"));
        }

        let roles = self
            .guard
            .call(
                "roles_for_user",
                self.store.roles_for_user(user_id, Some(target_org)),
            )
            .await
            .map_err(fail_closed)?;

        debug!(user_id = %user_id, org_id = %target_org, roles = roles.len(), "Organization switch allowed");
        Ok(Claims::derive(&user, Some(target_org), &roles))
    }
}

fn deny(user_id: Uuid, org_id: Uuid, reason: &str) -> AuthError {
    warn!(user_id = %user_id, org_id = %org_id, reason, "Organization switch denied");
    AuthError::AccessDenied("not a member of the requested organization".into())
}

fn fail_closed(err: AuthError) -> AuthError {
    if err.is_retryable() {
        err
    } else {
        warn!(error = %err, "Organization switch lookup failed");
        AuthError::AccessDenied("organization switch could not be verified".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryStore;
    use authz_core::{Membership, Role, RoleAssignment, User};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        authorizer: OrgSwitchAuthorizer,
        user: User,
        org_a: Uuid,
        org_b: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let user = User::new(tenant, "Alice", "alice@x.com", "hash");
        let (user, _) = store.register_user(user, "member").await.unwrap();
        store
            .add_membership(Membership::new(user.id, org_a, tenant))
            .await
            .unwrap();

        let approver = store
            .create_role(Role::new(tenant, Some(org_a), "approver").with_permissions(["approve-note"]))
            .await
            .unwrap();
        store
            .assign_role(RoleAssignment::new(user.id, approver.id, Some(org_a)))
            .await
            .unwrap();

        Fixture {
            authorizer: OrgSwitchAuthorizer::new(
                store.clone(),
                StoreGuard::new(Duration::from_millis(200)),
            ),
            store,
            user,
            org_a,
            org_b,
        }
    }

    #[tokio::test]
    async fn test_member_gets_scoped_claims() {
        let f = fixture().await;
        let claims = f
            .authorizer
            .switch_organization(f.user.id, f.org_a)
            .await
            .unwrap();

        assert_eq!(claims.org_id, Some(f.org_a));
        assert!(claims.has_role("member"));
        assert!(claims.has_role("approver"));
        assert!(claims.has_permission("approve-note"));
    }

    #[tokio::test]
    async fn test_non_member_denied() {
        let f = fixture().await;
        let err = f
            .authorizer
            .switch_organization(f.user.id, f.org_b)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_foreign_tenant_membership_denied() {
        let f = fixture().await;
        f.store
            .add_membership(Membership::new(f.user.id, f.org_b, Uuid::new_v4()))
            .await
            .unwrap();

        assert!(matches!(
            f.authorizer.switch_organization(f.user.id, f.org_b).await,
            Err(AuthError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_user_denied() {
        let f = fixture().await;
        f.store
            .deactivate_user(f.user.id, None, chrono::Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            f.authorizer.switch_organization(f.user.id, f.org_a).await,
            Err(AuthError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_denied() {
        let f = fixture().await;
        assert!(matches!(
            f.authorizer.switch_organization(Uuid::new_v4(), f.org_a).await,
            Err(AuthError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_outage_is_retryable() {
        let f = fixture().await;
        f.store.set_latency(Some(Duration::from_secs(5)));

        let err = f
            .authorizer
            .switch_organization(f.user.id, f.org_a)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}

//! In-process credential store
//!
//! Backs single-node deployments and tests. All tables sit behind one
//! lock, so multi-row operations such as registration are atomic.

use super::{CredentialStore, DirectoryStore, StoreError};
use crate::auth::models::{Credential, CredentialKind};
use async_trait::async_trait;
use authz_core::{Membership, Organization, Permission, Role, RoleAssignment, User};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    credentials: HashMap<(CredentialKind, String), Credential>,
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    assignments: Vec<RoleAssignment>,
    permissions: HashMap<String, Permission>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    organizations: HashMap<Uuid, Organization>,
}

impl Tables {
    fn email_taken(&self, tenant_id: Uuid, email: &str) -> bool {
        self.users
            .values()
            .any(|u| u.tenant_id == tenant_id && u.email == email)
    }

    fn role_by_name(&self, tenant_id: Uuid, org_id: Option<Uuid>, name: &str) -> Option<&Role> {
        self.roles
            .values()
            .find(|r| r.tenant_id == tenant_id && r.org_id == org_id && r.name == name)
    }

    fn assign(&mut self, assignment: RoleAssignment) {
        let exists = self.assignments.iter().any(|a| {
            a.user_id == assignment.user_id
                && a.role_id == assignment.role_id
                && a.org_id == assignment.org_id
        });
        if !exists {
            self.assignments.push(assignment);
        }
    }

    fn user_mut(&mut self, user_id: Uuid) -> Result<&mut User, StoreError> {
        self.users.get_mut(&user_id).ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(any(test, feature = "test-utils"))]
    latency: std::sync::Mutex<Option<std::time::Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored credentials of one kind, expired ones included
    pub async fn credential_count(&self, kind: CredentialKind) -> usize {
        self.tables
            .read()
            .await
            .credentials
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    #[cfg(any(test, feature = "test-utils"))]
    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    #[cfg(not(any(test, feature = "test-utils")))]
    async fn simulate_latency(&self) {}
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryStore {
    /// Delay every subsequent call, to exercise store timeouts
    pub fn set_latency(&self, latency: Option<std::time::Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Overwrite the stored expiry of a credential identified by its raw token
    pub async fn force_expiry(&self, kind: CredentialKind, raw_token: &str, at: DateTime<Utc>) -> bool {
        let hash = crate::auth::models::token_digest(raw_token);
        match self.tables.write().await.credentials.get_mut(&(kind, hash)) {
            Some(credential) => {
                credential.expires_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_credential(&self, credential: Credential) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let key = (credential.kind, credential.token_hash.clone());
        if tables.credentials.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} credential", credential.kind)));
        }
        tables.credentials.insert(key, credential);
        Ok(())
    }

    async fn find_credential(
        &self,
        kind: CredentialKind,
        token_hash: &str,
    ) -> Result<Option<Credential>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .await
            .credentials
            .get(&(kind, token_hash.to_string()))
            .cloned())
    }

    async fn delete_credential(
        &self,
        kind: CredentialKind,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .write()
            .await
            .credentials
            .remove(&(kind, token_hash.to_string()))
            .is_some())
    }

    async fn delete_user_credentials(
        &self,
        kind: CredentialKind,
        user_id: Uuid,
    ) -> Result<u64, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let before = tables.credentials.len();
        tables
            .credentials
            .retain(|(k, _), c| !(*k == kind && c.user_id == user_id));
        Ok((before - tables.credentials.len()) as u64)
    }

    async fn list_user_credentials(
        &self,
        kind: CredentialKind,
        user_id: Uuid,
    ) -> Result<Vec<Credential>, StoreError> {
        self.simulate_latency().await;
        let tables = self.tables.read().await;
        let mut found: Vec<Credential> = tables
            .credentials
            .iter()
            .filter(|((k, _), c)| *k == kind && c.user_id == user_id)
            .map(|(_, c)| c.clone())
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let before = tables.credentials.len();
        tables.credentials.retain(|_, c| c.is_live(now));
        Ok((before - tables.credentials.len()) as u64)
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        self.simulate_latency().await;
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(
        &self,
        tenant_id: Uuid,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .await
            .users
            .values()
            .find(|u| u.tenant_id == tenant_id && u.email == email)
            .cloned())
    }

    async fn find_users_by_email(&self, email: &str) -> Result<Vec<User>, StoreError> {
        self.simulate_latency().await;
        let mut found: Vec<User> = self
            .tables
            .read()
            .await
            .users
            .values()
            .filter(|u| u.email == email)
            .cloned()
            .collect();
        found.sort_by_key(|u| u.created_at);
        Ok(found)
    }

    async fn register_user(&self, user: User, role_name: &str) -> Result<(User, Role), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;

        if tables.email_taken(user.tenant_id, &user.email) {
            return Err(StoreError::Conflict("email".to_string()));
        }

        let role = match tables.role_by_name(user.tenant_id, None, role_name) {
            Some(role) => role.clone(),
            None => {
                let role = Role::new(user.tenant_id, None, role_name);
                tables.roles.insert(role.id, role.clone());
                role
            }
        };

        tables.users.insert(user.id, user.clone());
        tables.assign(RoleAssignment::new(user.id, role.id, None));

        Ok((user, role))
    }

    async fn register_organization(
        &self,
        organization: Organization,
        user: User,
        role_name: &str,
    ) -> Result<(User, Role), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;

        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("email".to_string()));
        }

        let mut role = Role::new(organization.tenant_id, None, role_name);
        role.is_system_role = true;

        let mut membership = Membership::new(user.id, organization.id, organization.tenant_id);
        membership.is_current = true;

        tables.roles.insert(role.id, role.clone());
        tables.users.insert(user.id, user.clone());
        tables.assign(RoleAssignment::new(user.id, role.id, None));
        tables
            .memberships
            .insert((membership.user_id, membership.org_id), membership);
        tables.organizations.insert(organization.id, organization);

        Ok((user, role))
    }

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, StoreError> {
        self.simulate_latency().await;
        Ok(self.tables.read().await.organizations.get(&org_id).cloned())
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(user_id)?;
        user.password_hash = password_hash.to_string();
        user.updated_at = at;
        Ok(())
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(user_id)?;
        user.last_login_at = Some(at);
        user.last_login_ip = ip_address.map(str::to_string);
        Ok(())
    }

    async fn mark_email_verified(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(user_id)?;
        user.email_verified_at = Some(at);
        user.updated_at = at;
        Ok(())
    }

    async fn deactivate_user(
        &self,
        user_id: Uuid,
        actor: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(user_id)?;
        user.is_active = false;
        user.deactivated_at = Some(at);
        user.deactivated_by = actor;
        user.updated_at = at;
        Ok(())
    }

    async fn roles_for_user(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<Role>, StoreError> {
        self.simulate_latency().await;
        let tables = self.tables.read().await;
        Ok(tables
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id && a.applies_to(org_id))
            .filter_map(|a| tables.roles.get(&a.role_id))
            .filter(|r| r.applies_to(org_id))
            .cloned()
            .collect())
    }

    async fn find_role(
        &self,
        tenant_id: Uuid,
        org_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Role>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .await
            .role_by_name(tenant_id, org_id, name)
            .cloned())
    }

    async fn create_role(&self, role: Role) -> Result<Role, StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        if tables
            .role_by_name(role.tenant_id, role.org_id, &role.name)
            .is_some()
        {
            return Err(StoreError::Conflict(format!("role {}", role.name)));
        }
        tables.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn grant_permission(&self, role_id: Uuid, permission: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        let role = tables.roles.get_mut(&role_id).ok_or(StoreError::NotFound)?;
        role.grant(permission);
        Ok(())
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&assignment.user_id)
            || !tables.roles.contains_key(&assignment.role_id)
        {
            return Err(StoreError::NotFound);
        }
        tables.assign(assignment);
        Ok(())
    }

    async fn upsert_permission(&self, permission: Permission) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut tables = self.tables.write().await;
        match tables.permissions.get_mut(&permission.name) {
            Some(existing) => existing.description = permission.description,
            None => {
                tables
                    .permissions
                    .insert(permission.name.clone(), permission);
            }
        }
        Ok(())
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        self.simulate_latency().await;
        let mut permissions: Vec<Permission> =
            self.tables.read().await.permissions.values().cloned().collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(permissions)
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, StoreError> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .read()
            .await
            .memberships
            .get(&(user_id, org_id))
            .cloned())
    }

    async fn memberships_for_user(&self, user_id: Uuid) -> Result<Vec<Membership>, StoreError> {
        self.simulate_latency().await;
        let mut found: Vec<Membership> = self
            .tables
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.joined_at);
        Ok(found)
    }

    async fn add_membership(&self, membership: Membership) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.tables
            .write()
            .await
            .memberships
            .insert((membership.user_id, membership.org_id), membership);
        Ok(())
    }
}

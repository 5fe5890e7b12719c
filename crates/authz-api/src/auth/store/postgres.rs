//! PostgreSQL credential store
//!
//! Schema lives in `migrations/0001_identity.sql`. Every method is one
//! statement except the two registration methods, which run in a transaction.

use super::{CredentialStore, DirectoryStore, StoreError};
use crate::auth::models::{Credential, CredentialKind};
use async_trait::async_trait;
use authz_core::{
    DatabaseConfig, Membership, Organization, Permission, Role, RoleAssignment, User,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../../migrations/0001_identity.sql");

const USER_COLUMNS: &str = "id, tenant_id, name, email, password_hash, is_active, \
    email_verified_at, deactivated_at, deactivated_by, last_login_at, last_login_ip, \
    created_at, updated_at";

const ROLE_COLUMNS: &str =
    "id, tenant_id, org_id, name, description, permissions, is_system_role, created_at, updated_at";

const CREDENTIAL_COLUMNS: &str = "kind, token_hash, user_id, org_id, created_at, expires_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.postgres_pool_size)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.postgres_url)
            .await
            .map_err(|e| StoreError::Backend(format!("PostgreSQL connection failed: {e}")))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn write_error(e: sqlx::Error, what: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(what.to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound,
        _ => backend(e),
    }
}

fn affected_or_not_found(rows: u64) -> Result<(), StoreError> {
    if rows == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    email: String,
    password_hash: String,
    is_active: bool,
    email_verified_at: Option<DateTime<Utc>>,
    deactivated_at: Option<DateTime<Utc>>,
    deactivated_by: Option<Uuid>,
    last_login_at: Option<DateTime<Utc>>,
    last_login_ip: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            is_active: row.is_active,
            email_verified_at: row.email_verified_at,
            deactivated_at: row.deactivated_at,
            deactivated_by: row.deactivated_by,
            last_login_at: row.last_login_at,
            last_login_ip: row.last_login_ip,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    id: Uuid,
    tenant_id: Uuid,
    org_id: Option<Uuid>,
    name: String,
    description: Option<String>,
    permissions: Vec<String>,
    is_system_role: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            tenant_id: row.tenant_id,
            org_id: row.org_id,
            name: row.name,
            description: row.description,
            permissions: row.permissions,
            is_system_role: row.is_system_role,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CredentialRow {
    kind: String,
    token_hash: String,
    user_id: Uuid,
    org_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = StoreError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let kind = CredentialKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Backend(format!("unknown credential kind: {}", row.kind)))?;
        Ok(Credential {
            kind,
            token_hash: row.token_hash,
            user_id: row.user_id,
            org_id: row.org_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MembershipRow {
    user_id: Uuid,
    org_id: Uuid,
    tenant_id: Uuid,
    is_current: bool,
    joined_at: DateTime<Utc>,
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        Membership {
            user_id: row.user_id,
            org_id: row.org_id,
            tenant_id: row.tenant_id,
            is_current: row.is_current,
            joined_at: row.joined_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct OrganizationRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PermissionRow {
    id: Uuid,
    name: String,
    description: String,
}

// ============================================================================
// Credentials
// ============================================================================

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_credential(&self, credential: Credential) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO credentials (kind, token_hash, user_id, org_id, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(credential.kind.as_str())
        .bind(&credential.token_hash)
        .bind(credential.user_id)
        .bind(credential.org_id)
        .bind(credential.created_at)
        .bind(credential.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "credential"))?;
        Ok(())
    }

    async fn find_credential(
        &self,
        kind: CredentialKind,
        token_hash: &str,
    ) -> Result<Option<Credential>, StoreError> {
        let row: Option<CredentialRow> = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE kind = $1 AND token_hash = $2"
        ))
        .bind(kind.as_str())
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(Credential::try_from).transpose()
    }

    async fn delete_credential(
        &self,
        kind: CredentialKind,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE kind = $1 AND token_hash = $2")
            .bind(kind.as_str())
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_credentials(
        &self,
        kind: CredentialKind,
        user_id: Uuid,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE kind = $1 AND user_id = $2")
            .bind(kind.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn list_user_credentials(
        &self,
        kind: CredentialKind,
        user_id: Uuid,
    ) -> Result<Vec<Credential>, StoreError> {
        let rows: Vec<CredentialRow> = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials \
             WHERE kind = $1 AND user_id = $2 ORDER BY created_at"
        ))
        .bind(kind.as_str())
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Credential::try_from).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Directory
// ============================================================================

#[async_trait]
impl DirectoryStore for PgStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row.map(User::from))
    }

    async fn find_user_by_email(
        &self,
        tenant_id: Uuid,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE tenant_id = $1 AND email = $2"
        ))
        .bind(tenant_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(User::from))
    }

    async fn find_users_by_email(&self, email: &str) -> Result<Vec<User>, StoreError> {
        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 ORDER BY created_at"
        ))
        .bind(email)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn register_user(&self, user: User, role_name: &str) -> Result<(User, Role), StoreError> {
        // Dropping the transaction on any early return rolls it back
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            "INSERT INTO users (id, tenant_id, name, email, password_hash, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.id)
        .bind(user.tenant_id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "email"))?;

        let candidate = Role::new(user.tenant_id, None, role_name);
        sqlx::query(
            "INSERT INTO roles (id, tenant_id, org_id, name, permissions, is_system_role, created_at, updated_at) \
             VALUES ($1, $2, NULL, $3, $4, FALSE, $5, $5) ON CONFLICT DO NOTHING",
        )
        .bind(candidate.id)
        .bind(candidate.tenant_id)
        .bind(&candidate.name)
        .bind(&candidate.permissions)
        .bind(candidate.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        let role: RoleRow = sqlx::query_as(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles WHERE tenant_id = $1 AND org_id IS NULL AND name = $2"
        ))
        .bind(user.tenant_id)
        .bind(role_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id, org_id, assigned_at) \
             VALUES ($1, $2, NULL, $3) ON CONFLICT DO NOTHING",
        )
        .bind(user.id)
        .bind(role.id)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        Ok((user, role.into()))
    }

    async fn register_organization(
        &self,
        organization: Organization,
        user: User,
        role_name: &str,
    ) -> Result<(User, Role), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Serializes concurrent sign-ups for one email across tenants
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&user.email)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let taken: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1 LIMIT 1")
            .bind(&user.email)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if taken.is_some() {
            return Err(StoreError::Conflict("email".to_string()));
        }

        sqlx::query(
            "INSERT INTO organizations (id, tenant_id, name, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(organization.id)
        .bind(organization.tenant_id)
        .bind(&organization.name)
        .bind(user.id)
        .bind(organization.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "organization"))?;

        sqlx::query(
            "INSERT INTO users (id, tenant_id, name, email, password_hash, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.id)
        .bind(user.tenant_id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "email"))?;

        let mut role = Role::new(organization.tenant_id, None, role_name);
        role.is_system_role = true;
        sqlx::query(
            "INSERT INTO roles (id, tenant_id, org_id, name, permissions, is_system_role, created_at, updated_at) \
             VALUES ($1, $2, NULL, $3, $4, TRUE, $5, $5)",
        )
        .bind(role.id)
        .bind(role.tenant_id)
        .bind(&role.name)
        .bind(&role.permissions)
        .bind(role.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "role"))?;

        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id, org_id, assigned_at) VALUES ($1, $2, NULL, $3)",
        )
        .bind(user.id)
        .bind(role.id)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query(
            "INSERT INTO user_organizations (user_id, org_id, tenant_id, is_current, joined_at) \
             VALUES ($1, $2, $3, TRUE, $4)",
        )
        .bind(user.id)
        .bind(organization.id)
        .bind(organization.tenant_id)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "membership"))?;

        tx.commit().await.map_err(backend)?;

        Ok((user, role))
    }

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, StoreError> {
        let row: Option<OrganizationRow> = sqlx::query_as(
            "SELECT id, tenant_id, name, created_by, created_at FROM organizations WHERE id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(Organization::from))
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1")
                .bind(user_id)
                .bind(password_hash)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        affected_or_not_found(result.rows_affected())
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET last_login_at = $2, last_login_ip = $3 WHERE id = $1")
                .bind(user_id)
                .bind(at)
                .bind(ip_address)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        affected_or_not_found(result.rows_affected())
    }

    async fn mark_email_verified(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET email_verified_at = $2, updated_at = $2 WHERE id = $1")
                .bind(user_id)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        affected_or_not_found(result.rows_affected())
    }

    async fn deactivate_user(
        &self,
        user_id: Uuid,
        actor: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET is_active = FALSE, deactivated_at = $2, deactivated_by = $3, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(at)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        affected_or_not_found(result.rows_affected())
    }

    async fn roles_for_user(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<Role>, StoreError> {
        let rows: Vec<RoleRow> = sqlx::query_as(
            "SELECT DISTINCT r.id, r.tenant_id, r.org_id, r.name, r.description, r.permissions, \
                    r.is_system_role, r.created_at, r.updated_at \
             FROM roles r JOIN user_roles ur ON ur.role_id = r.id \
             WHERE ur.user_id = $1 \
               AND (ur.org_id IS NULL OR ur.org_id = $2::uuid) \
               AND (r.org_id IS NULL OR r.org_id = $2::uuid)",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn find_role(
        &self,
        tenant_id: Uuid,
        org_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Role>, StoreError> {
        let row: Option<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles \
             WHERE tenant_id = $1 AND org_id IS NOT DISTINCT FROM $2 AND name = $3"
        ))
        .bind(tenant_id)
        .bind(org_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(Role::from))
    }

    async fn create_role(&self, role: Role) -> Result<Role, StoreError> {
        sqlx::query(
            "INSERT INTO roles (id, tenant_id, org_id, name, description, permissions, is_system_role, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(role.id)
        .bind(role.tenant_id)
        .bind(role.org_id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(&role.permissions)
        .bind(role.is_system_role)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "role"))?;
        Ok(role)
    }

    async fn grant_permission(&self, role_id: Uuid, permission: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE roles SET permissions = array_append(permissions, $2), updated_at = NOW() \
             WHERE id = $1 AND NOT ($2 = ANY(permissions))",
        )
        .bind(role_id)
        .bind(permission)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing updated: either already granted or no such role
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM roles WHERE id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        exists.map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id, org_id, assigned_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind(assignment.user_id)
        .bind(assignment.role_id)
        .bind(assignment.org_id)
        .bind(assignment.assigned_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "role assignment"))?;
        Ok(())
    }

    async fn upsert_permission(&self, permission: Permission) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO permissions (id, name, description) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET description = EXCLUDED.description",
        )
        .bind(permission.id)
        .bind(&permission.name)
        .bind(&permission.description)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        let rows: Vec<PermissionRow> =
            sqlx::query_as("SELECT id, name, description FROM permissions ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|r| Permission {
                id: r.id,
                name: r.name,
                description: r.description,
            })
            .collect())
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, StoreError> {
        let row: Option<MembershipRow> = sqlx::query_as(
            "SELECT user_id, org_id, tenant_id, is_current, joined_at FROM user_organizations \
             WHERE user_id = $1 AND org_id = $2",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(Membership::from))
    }

    async fn memberships_for_user(&self, user_id: Uuid) -> Result<Vec<Membership>, StoreError> {
        let rows: Vec<MembershipRow> = sqlx::query_as(
            "SELECT user_id, org_id, tenant_id, is_current, joined_at FROM user_organizations \
             WHERE user_id = $1 ORDER BY joined_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Membership::from).collect())
    }

    async fn add_membership(&self, membership: Membership) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_organizations (user_id, org_id, tenant_id, is_current, joined_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, org_id) DO UPDATE SET is_current = EXCLUDED.is_current",
        )
        .bind(membership.user_id)
        .bind(membership.org_id)
        .bind(membership.tenant_id)
        .bind(membership.is_current)
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "membership"))?;
        Ok(())
    }
}

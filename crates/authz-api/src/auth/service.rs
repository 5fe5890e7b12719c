//! Identity service
//!
//! Business logic for registration, login, session lifecycle, password
//! recovery, email verification, organization switching and role
//! administration. Token mechanics live in [`TokenIssuer`]; this layer
//! decides who gets which token and what a presented token means.
//!
//! Failures that would reveal whether an account exists (unknown email,
//! wrong password, deactivated user) are reported identically.

use super::clock::Clock;
use super::codec::{JwtCodec, TokenCodec};
use super::issuer::TokenIssuer;
use super::models::{
    AssignRoleRequest, AuthGrant, ClientInfo, CreateRoleRequest, CredentialKind,
    GrantPermissionRequest, OrganizationRegistration, RegisterOrganizationRequest,
    RegisterRequest, SessionInfo,
};
use super::notifier::{Notifier, NotifyError};
use super::org_switch::OrgSwitchAuthorizer;
use super::password::{validate_password_strength, PasswordConfig};
use super::registry::PermissionRegistry;
use super::store::{IdentityStore, StoreError, StoreGuard};
use crate::audit::{audit_log, AuditEvent};
use authz_core::{
    normalize_email, AuthConfig, AuthError, Claims, Organization, Permission, Result, Role,
    RoleAssignment, User,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Lifetimes and policy switches, taken from [`AuthConfig`]
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub session_ttl: Duration,
    pub refresh_ttl: Duration,
    pub password_reset_ttl: Duration,
    pub otp_ttl: Duration,
    pub email_verification_ttl: Duration,
    pub super_admin_role: String,
    pub require_verified_email: bool,
    pub revoke_sessions_on_password_reset: bool,
}

impl ServiceSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            session_ttl: config.session_ttl(),
            refresh_ttl: config.refresh_ttl(),
            password_reset_ttl: config.password_reset_ttl(),
            otp_ttl: config.otp_ttl(),
            email_verification_ttl: config.email_verification_ttl(),
            super_admin_role: config.super_admin_role.clone(),
            require_verified_email: config.require_verified_email,
            revoke_sessions_on_password_reset: config.revoke_sessions_on_password_reset,
        }
    }
}

pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
    issuer: TokenIssuer,
    org_switch: OrgSwitchAuthorizer,
    notifier: Arc<dyn Notifier>,
    guard: StoreGuard,
    settings: ServiceSettings,
    /// Hash checked against when the email is unknown, so that path costs
    /// the same as a wrong password
    dummy_hash: OnceCell<String>,
}

impl IdentityService {
    pub fn new<S>(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self
    where
        S: IdentityStore + 'static,
    {
        let guard = StoreGuard::new(config.store_timeout());
        let codec: Arc<dyn TokenCodec> =
            Arc::new(JwtCodec::new(&config.jwt_secret, config.jwt_issuer.clone()));

        let issuer = TokenIssuer::new(store.clone(), codec, clock, config.store_timeout())
            .with_password_config(PasswordConfig::from_auth_config(config))
            .with_revoke_prior_reset_tokens(config.revoke_prior_reset_tokens);

        Self {
            org_switch: OrgSwitchAuthorizer::new(store.clone(), guard),
            store,
            issuer,
            notifier,
            guard,
            settings: ServiceSettings::from_config(config),
            dummy_hash: OnceCell::new(),
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.issuer.now()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Create a user in the caller's tenant holding the tenant-wide role
    /// `role_name`
    ///
    /// The caller cannot hand out more than they hold: the super admin role
    /// needs the super admin role, and an existing role needs every one of
    /// its permissions. The user row, the role (created on first use) and
    /// the assignment are written atomically. A verification email follows;
    /// if it cannot be delivered the account still exists.
    pub async fn register(&self, actor: &Claims, request: RegisterRequest) -> Result<User> {
        request
            .validate()
            .map_err(|e| AuthError::WeakInput(e.to_string()))?;
        validate_password_strength(&request.password).map_err(AuthError::WeakInput)?;

        let tenant_id = actor.tenant_id;
        let role_name = request.role_name.trim();
        let email = normalize_email(&request.email);
        self.check_grantable(actor, role_name).await?;

        let existing = self
            .guard
            .call(
                "find_user_by_email",
                self.store.find_user_by_email(tenant_id, &email),
            )
            .await?;
        if existing.is_some() {
            return Err(self.registration_failed(&email, tenant_id, AuthError::DuplicateEmail));
        }

        let password_hash = self.issuer.hash_password(&request.password).await?;
        let user = User::new(tenant_id, request.name.trim(), &email, password_hash);

        let (user, role) = self
            .guard
            .try_call("register_user", self.store.register_user(user, role_name))
            .await?
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    self.registration_failed(&email, tenant_id, AuthError::DuplicateEmail)
                }
                other => other.into(),
            })?;

        audit_log(&AuditEvent::RegistrationSuccess {
            user_id: user.id,
            tenant_id: user.tenant_id,
            role: role.name.clone(),
        });
        info!(user_id = %user.id, actor = %actor.user_id, role = %role.name, "User registered");

        if let Err(e) = self.send_verification(&user).await {
            warn!(user_id = %user.id, error = %e, "Verification email not sent after registration");
        }

        Ok(user)
    }

    /// Refuse roles carrying privileges the actor does not hold
    async fn check_grantable(&self, actor: &Claims, role_name: &str) -> Result<()> {
        if self.is_super_admin(actor) {
            return Ok(());
        }
        let existing = self
            .guard
            .call(
                "find_role",
                self.store.find_role(actor.tenant_id, None, role_name),
            )
            .await?;
        self.check_delegable(actor, role_name, existing.as_ref())
    }

    fn is_super_admin(&self, actor: &Claims) -> bool {
        actor.has_role(&self.settings.super_admin_role)
    }

    /// Nobody hands out the super admin role, a system role or a permission
    /// they do not hold themselves, super admins excepted
    fn check_delegable(&self, actor: &Claims, role_name: &str, role: Option<&Role>) -> Result<()> {
        if self.is_super_admin(actor) {
            return Ok(());
        }

        let refused = if role_name == self.settings.super_admin_role {
            Some("super admin role")
        } else if role.is_some_and(|r| r.is_system_role) {
            Some("system role")
        } else if role.is_some_and(|r| r.permissions.iter().any(|p| !actor.has_permission(p))) {
            Some("permissions not held")
        } else {
            None
        };

        match refused {
            Some(reason) => {
                warn!(actor = %actor.user_id, role = role_name, reason, "Role grant refused");
                Err(AuthError::AccessDenied("role exceeds the caller's privileges".into()))
            }
            None => Ok(()),
        }
    }

    fn check_permissions_held<I, S>(&self, actor: &Claims, permissions: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.is_super_admin(actor) {
            return Ok(());
        }
        match permissions
            .into_iter()
            .find(|p| !actor.has_permission(p.as_ref()))
        {
            Some(missing) => {
                warn!(actor = %actor.user_id, permission = missing.as_ref(), "Permission grant refused");
                Err(AuthError::AccessDenied("permission exceeds the caller's privileges".into()))
            }
            None => Ok(()),
        }
    }

    /// Public sign-up: a new tenant with its first organization and a super
    /// admin user who is signed in straight away
    ///
    /// The email must not be registered in any tenant.
    pub async fn register_organization(
        &self,
        request: RegisterOrganizationRequest,
        client: &ClientInfo,
    ) -> Result<OrganizationRegistration> {
        request
            .validate()
            .map_err(|e| AuthError::WeakInput(e.to_string()))?;
        validate_password_strength(&request.password).map_err(AuthError::WeakInput)?;

        let organization_name = request.organization_name.trim();
        let name_len = organization_name.chars().count();
        if !(3..=255).contains(&name_len) {
            return Err(AuthError::WeakInput(
                "organization name must be between 3 and 255 characters".into(),
            ));
        }

        let tenant_id = Uuid::new_v4();
        let email = normalize_email(&request.email);
        let taken = self
            .guard
            .call(
                "find_users_by_email",
                self.store.find_users_by_email(&email),
            )
            .await?;
        if !taken.is_empty() {
            return Err(self.registration_failed(&email, tenant_id, AuthError::DuplicateEmail));
        }

        let password_hash = self.issuer.hash_password(&request.password).await?;
        let user = User::new(tenant_id, request.name.trim(), &email, password_hash);
        let organization = Organization::new(tenant_id, organization_name, Some(user.id));
        let org_id = organization.id;
        let organization_name = organization.name.clone();

        let (user, role) = self
            .guard
            .try_call(
                "register_organization",
                self.store.register_organization(
                    organization,
                    user,
                    &self.settings.super_admin_role,
                ),
            )
            .await?
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    self.registration_failed(&email, tenant_id, AuthError::DuplicateEmail)
                }
                other => other.into(),
            })?;

        audit_log(&AuditEvent::OrganizationRegistered {
            user_id: user.id,
            tenant_id,
            org_id,
            ip_address: client.ip_address.clone(),
        });
        info!(user_id = %user.id, tenant_id = %tenant_id, org_id = %org_id, "Organization registered");

        if let Err(e) = self.send_verification(&user).await {
            warn!(user_id = %user.id, error = %e, "Verification email not sent after registration");
        }

        let claims = Claims::derive(&user, Some(org_id), std::slice::from_ref(&role));
        let is_super_admin = claims.has_role(&self.settings.super_admin_role);
        let grant = self.open_session(claims, None).await?;

        Ok(OrganizationRegistration {
            user,
            org_id,
            organization_name,
            is_super_admin,
            grant,
        })
    }

    fn registration_failed(&self, email: &str, tenant_id: Uuid, err: AuthError) -> AuthError {
        audit_log(&AuditEvent::RegistrationFailure {
            email: email.to_string(),
            tenant_id,
            reason: err.to_string(),
        });
        err
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Authenticate with email and password and open a session
    ///
    /// With no `org_id` the session is scoped to the user's current
    /// organization, else their first one, else none.
    pub async fn login(
        &self,
        tenant_id: Uuid,
        email: &str,
        password: &str,
        org_id: Option<Uuid>,
        client: &ClientInfo,
    ) -> Result<AuthGrant> {
        let email = normalize_email(email);
        let found = self
            .guard
            .call(
                "find_user_by_email",
                self.store.find_user_by_email(tenant_id, &email),
            )
            .await?;

        let user = match found {
            Some(user) => user,
            None => {
                self.burn_password_check(password).await;
                return Err(self.login_failed(&email, tenant_id, client, "unknown email"));
            }
        };

        if !self.issuer.verify_password(&user.password_hash, password).await {
            return Err(self.login_failed(&email, tenant_id, client, "wrong password"));
        }

        self.complete_login(user, org_id, client, false).await
    }

    /// Authenticate by email alone, across every tenant
    ///
    /// The oldest account with this email whose password matches wins. The
    /// session must land in an organization: the requested one, else the
    /// user's current one, else their first one.
    pub async fn login_global(
        &self,
        email: &str,
        password: &str,
        org_id: Option<Uuid>,
        client: &ClientInfo,
    ) -> Result<AuthGrant> {
        let email = normalize_email(email);
        let candidates = self
            .guard
            .call(
                "find_users_by_email",
                self.store.find_users_by_email(&email),
            )
            .await?;

        let first_tenant = match candidates.first() {
            Some(user) => user.tenant_id,
            None => {
                self.burn_password_check(password).await;
                return Err(self.login_failed(&email, Uuid::nil(), client, "unknown email"));
            }
        };

        let mut matched = None;
        for user in candidates {
            if self.issuer.verify_password(&user.password_hash, password).await {
                matched = Some(user);
                break;
            }
        }
        let user = matched
            .ok_or_else(|| self.login_failed(&email, first_tenant, client, "wrong password"))?;

        self.complete_login(user, org_id, client, true).await
    }

    /// Shared tail of both logins, once the password has been checked
    async fn complete_login(
        &self,
        user: User,
        org_id: Option<Uuid>,
        client: &ClientInfo,
        require_org: bool,
    ) -> Result<AuthGrant> {
        let tenant_id = user.tenant_id;
        let email = user.email.clone();
        if !user.is_active {
            return Err(self.login_failed(&email, tenant_id, client, "account deactivated"));
        }

        let org_id = self.resolve_org(&user, org_id).await?;
        if require_org && org_id.is_none() {
            let _ = self.login_failed(&email, tenant_id, client, "no organization");
            return Err(AuthError::AccessDenied(
                "user is not a member of any organization".into(),
            ));
        }
        let claims = self.derive_claims(&user, org_id).await?;

        if self.settings.require_verified_email
            && !user.is_email_verified()
            && !claims.has_role(&self.settings.super_admin_role)
        {
            let _ = self.login_failed(&email, tenant_id, client, "email not verified");
            return Err(AuthError::AccessDenied("email address not verified".into()));
        }

        let grant = self.open_session(claims, None).await?;

        let now = self.now();
        if let Err(e) = self
            .guard
            .call(
                "record_login",
                self.store
                    .record_login(user.id, now, client.ip_address.as_deref()),
            )
            .await
        {
            warn!(user_id = %user.id, error = %e, "Failed to record last login");
        }

        audit_log(&AuditEvent::LoginSuccess {
            user_id: user.id,
            tenant_id,
            org_id,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });

        Ok(grant)
    }

    async fn burn_password_check(&self, password: &str) {
        let dummy = self
            .dummy_hash
            .get_or_try_init(|| self.issuer.hash_password("dummy-password-for-timing"))
            .await;
        if let Ok(hash) = dummy {
            let _ = self.issuer.verify_password(hash, password).await;
        }
    }

    fn login_failed(
        &self,
        email: &str,
        tenant_id: Uuid,
        client: &ClientInfo,
        reason: &str,
    ) -> AuthError {
        audit_log(&AuditEvent::LoginFailure {
            email: email.to_string(),
            tenant_id,
            reason: reason.to_string(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });
        AuthError::InvalidCredentials
    }

    /// Pick and check the organization a session will be scoped to
    async fn resolve_org(&self, user: &User, requested: Option<Uuid>) -> Result<Option<Uuid>> {
        if let Some(org_id) = requested {
            let membership = self
                .guard
                .call("find_membership", self.store.find_membership(user.id, org_id))
                .await?;
            return match membership {
                Some(m) if m.tenant_id == user.tenant_id => Ok(Some(org_id)),
                _ => {
                    warn!(user_id = %user.id, org_id = %org_id, "Session requested for foreign organization");
                    Err(AuthError::AccessDenied(
                        "not a member of the requested organization".into(),
                    ))
                }
            };
        }

        let memberships = self
            .guard
            .call(
                "memberships_for_user",
                self.store.memberships_for_user(user.id),
            )
            .await?;
        let own: Vec<_> = memberships
            .into_iter()
            .filter(|m| m.tenant_id == user.tenant_id)
            .collect();

        let chosen = own
            .iter()
            .find(|m| m.is_current)
            .or_else(|| own.first());

        Ok(chosen.map(|m| m.org_id))
    }

    async fn derive_claims(&self, user: &User, org_id: Option<Uuid>) -> Result<Claims> {
        let roles = self
            .guard
            .call("roles_for_user", self.store.roles_for_user(user.id, org_id))
            .await?;
        Ok(Claims::derive(user, org_id, &roles))
    }

    /// Issue a session for `claims`, reusing `refresh` when given
    async fn open_session(
        &self,
        claims: Claims,
        refresh: Option<(String, DateTime<Utc>)>,
    ) -> Result<AuthGrant> {
        let (session_token, session_expires_at) = self
            .issuer
            .issue_session(&claims, self.settings.session_ttl)
            .await?;

        let (refresh_token, refresh_expires_at) = match refresh {
            Some(existing) => existing,
            None => {
                self.issuer
                    .issue_refresh_token(claims.user_id, self.settings.refresh_ttl)
                    .await?
            }
        };

        Ok(AuthGrant {
            session_token,
            session_expires_at,
            refresh_token,
            refresh_expires_at,
            claims,
        })
    }

    /// Open a new session from a refresh token
    ///
    /// Claims are derived from the roles the user holds now, so grants and
    /// revocations made since login take effect. The refresh token itself is
    /// returned unchanged.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        tenant_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<AuthGrant> {
        let credential = self
            .issuer
            .peek_token(CredentialKind::Refresh, refresh_token)
            .await
            .map_err(AuthError::normalized)?;

        let user = self
            .guard
            .call("find_user", self.store.find_user(credential.user_id))
            .await?
            .filter(|u| u.is_active && u.tenant_id == tenant_id)
            .ok_or_else(|| {
                debug!(user_id = %credential.user_id, "Refresh token presented for unusable account");
                AuthError::InvalidToken
            })?;

        let org_id = self.resolve_org(&user, org_id).await?;
        let claims = self.derive_claims(&user, org_id).await?;
        let grant = self
            .open_session(
                claims,
                Some((refresh_token.to_string(), credential.expires_at)),
            )
            .await?;

        audit_log(&AuditEvent::TokenRefresh {
            user_id: user.id,
            org_id,
        });

        Ok(grant)
    }

    /// Revoke a session and, optionally, a refresh token. Idempotent.
    pub async fn logout(&self, session_token: &str, refresh_token: Option<&str>) -> Result<()> {
        let user_id = self
            .issuer
            .decode_session(session_token)
            .ok()
            .map(|c| c.user_id);

        self.issuer
            .revoke(CredentialKind::Session, session_token)
            .await?;

        let refresh_revoked = match refresh_token {
            Some(token) => self.issuer.revoke(CredentialKind::Refresh, token).await?,
            None => false,
        };

        if let Some(user_id) = user_id {
            audit_log(&AuditEvent::Logout {
                user_id,
                refresh_revoked,
            });
        }
        Ok(())
    }

    /// Claims of a live session token
    ///
    /// Absent, expired, revoked and malformed tokens are all `InvalidToken`.
    pub async fn validate_token(&self, token: &str) -> Result<Claims> {
        let claims = self.issuer.decode_session(token)?;
        self.issuer
            .peek_token(CredentialKind::Session, token)
            .await
            .map_err(AuthError::normalized)?;
        Ok(claims)
    }

    /// Revoke every session and refresh token of the user
    pub async fn invalidate_all_sessions(&self, user_id: Uuid) -> Result<u64> {
        let sessions = self
            .issuer
            .revoke_all(CredentialKind::Session, user_id)
            .await?;
        let refresh_tokens = self
            .issuer
            .revoke_all(CredentialKind::Refresh, user_id)
            .await?;

        audit_log(&AuditEvent::SessionsInvalidated {
            user_id,
            sessions,
            refresh_tokens,
        });
        Ok(sessions)
    }

    /// Live sessions of the user, oldest first
    pub async fn get_active_sessions(&self, user_id: Uuid) -> Result<Vec<SessionInfo>> {
        let mut sessions = self
            .issuer
            .list_live(CredentialKind::Session, user_id)
            .await?;
        sessions.sort_by_key(|c| c.created_at);
        Ok(sessions.iter().map(SessionInfo::from).collect())
    }

    // ========================================================================
    // Password recovery
    // ========================================================================

    /// Email a reset link to the account, if there is one
    ///
    /// Succeeds for unknown addresses. A delivery failure is reported so the
    /// user can fix their address; the issued token stays valid.
    pub async fn forgot_password(&self, tenant_id: Uuid, email: &str) -> Result<()> {
        let Some(user) = self.active_user_by_email(tenant_id, email).await? else {
            return Ok(());
        };

        let token = self
            .issuer
            .issue_password_reset(user.id, self.settings.password_reset_ttl)
            .await?;

        audit_log(&AuditEvent::PasswordResetRequested {
            user_id: user.id,
            channel: "link".to_string(),
        });

        let sent = self
            .notifier
            .send_password_reset_email(&user.email, &user.name, &token)
            .await;
        self.delivered(&user, sent).await
    }

    /// Email a five-digit reset code instead of a link
    pub async fn forgot_password_with_otp(&self, tenant_id: Uuid, email: &str) -> Result<()> {
        let Some(user) = self.active_user_by_email(tenant_id, email).await? else {
            return Ok(());
        };

        let code = self
            .issuer
            .issue_password_reset_otp(user.id, self.settings.otp_ttl)
            .await?;

        audit_log(&AuditEvent::PasswordResetRequested {
            user_id: user.id,
            channel: "otp".to_string(),
        });

        let sent = self
            .notifier
            .send_otp_password_reset_email(&user.email, &user.name, &code)
            .await;
        self.delivered(&user, sent).await
    }

    pub async fn reset_password_with_otp(
        &self,
        tenant_id: Uuid,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> Result<()> {
        validate_password_strength(new_password).map_err(AuthError::WeakInput)?;

        let user = self
            .active_user_by_email(tenant_id, email)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        self.issuer
            .consume_otp(user.id, code)
            .await
            .map_err(AuthError::normalized)?;

        self.set_password(user.id, new_password).await
    }

    /// Set a new password with a single-use reset token
    pub async fn reset_password_by_token(&self, token: &str, new_password: &str) -> Result<()> {
        validate_password_strength(new_password).map_err(AuthError::WeakInput)?;

        let credential = self
            .issuer
            .consume_token(CredentialKind::PasswordReset, token)
            .await
            .map_err(AuthError::normalized)?;

        let user = self
            .guard
            .call("find_user", self.store.find_user(credential.user_id))
            .await?
            .filter(|u| u.is_active);
        let Some(user) = user else {
            warn!(user_id = %credential.user_id, "Reset token presented for inactive account");
            return Err(AuthError::InvalidToken);
        };

        self.set_password(user.id, new_password).await
    }

    async fn set_password(&self, user_id: Uuid, new_password: &str) -> Result<()> {
        let hash = self.issuer.hash_password(new_password).await?;
        let now = self.now();

        self.guard
            .call(
                "update_password",
                self.store.update_password(user_id, &hash, now),
            )
            .await
            .map_err(AuthError::normalized)?;

        let sessions_revoked = if self.settings.revoke_sessions_on_password_reset {
            self.invalidate_all_sessions(user_id).await?
        } else {
            0
        };

        audit_log(&AuditEvent::PasswordChange {
            user_id,
            sessions_revoked,
        });
        Ok(())
    }

    async fn active_user_by_email(&self, tenant_id: Uuid, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        let user = self
            .guard
            .call(
                "find_user_by_email",
                self.store.find_user_by_email(tenant_id, &email),
            )
            .await?;
        if user.is_none() {
            debug!(tenant_id = %tenant_id, "Recovery requested for unknown account");
        }
        Ok(user.filter(|u| u.is_active))
    }

    /// Map a delivery result, falling back to an "update your email" notice
    async fn delivered(&self, user: &User, sent: std::result::Result<(), NotifyError>) -> Result<()> {
        let Err(e) = sent else {
            return Ok(());
        };

        warn!(user_id = %user.id, error = %e, "Notification delivery failed");
        if let Err(e) = self
            .notifier
            .send_email_update_notification(&user.email, &user.name)
            .await
        {
            warn!(user_id = %user.id, error = %e, "Email update notice failed as well");
        }
        Err(AuthError::NotificationFailed(
            "message could not be delivered; please update your email address".into(),
        ))
    }

    // ========================================================================
    // Email verification
    // ========================================================================

    /// Re-send the verification link
    ///
    /// Succeeds without sending for unknown, deactivated or already verified
    /// accounts.
    pub async fn send_verification_email(&self, user_id: Uuid) -> Result<()> {
        let user = self
            .guard
            .call("find_user", self.store.find_user(user_id))
            .await?
            .filter(|u| u.is_active && !u.is_email_verified());
        match user {
            Some(user) => self.send_verification(&user).await,
            None => {
                debug!(user_id = %user_id, "Verification requested for unknown or settled account");
                Ok(())
            }
        }
    }

    async fn send_verification(&self, user: &User) -> Result<()> {
        let token = self
            .issuer
            .issue_email_verification(user.id, self.settings.email_verification_ttl)
            .await?;
        let sent = self
            .notifier
            .send_verification_email(&user.email, &user.name, &token)
            .await;
        self.delivered(user, sent).await
    }

    /// Mark the user's email verified; the token must have been issued to them
    pub async fn verify_email(&self, user_id: Uuid, token: &str) -> Result<()> {
        let credential = self
            .issuer
            .peek_token(CredentialKind::EmailVerification, token)
            .await
            .map_err(AuthError::normalized)?;
        if credential.user_id != user_id {
            warn!(user_id = %user_id, "Verification token presented for another user");
            return Err(AuthError::InvalidToken);
        }

        self.issuer
            .consume_token(CredentialKind::EmailVerification, token)
            .await
            .map_err(AuthError::normalized)?;

        let now = self.now();
        self.guard
            .call(
                "mark_email_verified",
                self.store.mark_email_verified(user_id, now),
            )
            .await
            .map_err(AuthError::normalized)?;

        audit_log(&AuditEvent::EmailVerified { user_id });
        Ok(())
    }

    // ========================================================================
    // Organizations
    // ========================================================================

    /// Move the caller to `target_org`
    ///
    /// The presenting session is revoked and replaced by one scoped to the
    /// target organization; other sessions are untouched.
    pub async fn switch_organization(
        &self,
        caller: &Claims,
        current_session: &str,
        target_org: Uuid,
    ) -> Result<AuthGrant> {
        let claims = self
            .org_switch
            .switch_organization(caller.user_id, target_org)
            .await?;

        let grant = self.open_session(claims, None).await?;

        if let Err(e) = self
            .issuer
            .revoke(CredentialKind::Session, current_session)
            .await
        {
            warn!(user_id = %caller.user_id, error = %e, "Previous session not revoked after switch");
        }

        audit_log(&AuditEvent::OrganizationSwitch {
            user_id: caller.user_id,
            from_org: caller.org_id,
            to_org: target_org,
        });
        info!(user_id = %caller.user_id, org_id = %target_org, "Organization switched");

        Ok(grant)
    }

    // ========================================================================
    // Role administration
    // ========================================================================

    pub async fn create_role(&self, actor: &Claims, request: CreateRoleRequest) -> Result<Role> {
        request
            .validate()
            .map_err(|e| AuthError::WeakInput(e.to_string()))?;

        let name = request.name.trim();
        self.check_delegable(actor, name, None)?;
        self.check_permissions_held(actor, &request.permissions)?;

        let mut role = Role::new(actor.tenant_id, request.org_id, name)
            .with_permissions(request.permissions);
        role.description = request.description;

        let role = self
            .guard
            .try_call("create_role", self.store.create_role(role))
            .await?
            .map_err(|e| match e {
                StoreError::Conflict(_) => AuthError::WeakInput("role already exists".into()),
                other => other.into(),
            })?;

        audit_log(&AuditEvent::RoleCreated {
            role_id: role.id,
            tenant_id: role.tenant_id,
            org_id: role.org_id,
            name: role.name.clone(),
            actor: actor.user_id,
        });
        Ok(role)
    }

    /// Add a permission to a role; takes effect at the holders' next refresh
    pub async fn grant_role_permission(
        &self,
        actor: &Claims,
        request: GrantPermissionRequest,
    ) -> Result<Role> {
        let permission = request.permission.trim();
        if permission.is_empty() {
            return Err(AuthError::WeakInput("permission name is empty".into()));
        }

        let role = self
            .find_role(actor.tenant_id, request.org_id, &request.role_name)
            .await?;
        self.check_delegable(actor, &role.name, Some(&role))?;
        self.check_permissions_held(actor, [permission])?;
        self.guard
            .call(
                "grant_permission",
                self.store.grant_permission(role.id, permission),
            )
            .await?;

        audit_log(&AuditEvent::RolePermissionGranted {
            role_id: role.id,
            permission: permission.to_string(),
            actor: actor.user_id,
        });

        Ok(role.with_permissions([permission]))
    }

    pub async fn assign_role(&self, actor: &Claims, request: AssignRoleRequest) -> Result<()> {
        let user = self.tenant_user(actor, request.user_id).await?;
        let role = self
            .find_role(actor.tenant_id, request.org_id, &request.role_name)
            .await?;
        self.check_delegable(actor, &role.name, Some(&role))?;
        let org_id = request.org_id.or(role.org_id);

        self.guard
            .call(
                "assign_role",
                self.store
                    .assign_role(RoleAssignment::new(user.id, role.id, org_id)),
            )
            .await?;

        audit_log(&AuditEvent::RoleAssigned {
            user_id: user.id,
            role_id: role.id,
            org_id,
            actor: actor.user_id,
        });
        Ok(())
    }

    /// Soft-deactivate a user and end all of their sessions
    pub async fn deactivate_user(&self, actor: &Claims, user_id: Uuid) -> Result<()> {
        let user = self.tenant_user(actor, user_id).await?;
        let now = self.now();

        self.guard
            .call(
                "deactivate_user",
                self.store.deactivate_user(user.id, Some(actor.user_id), now),
            )
            .await?;
        self.invalidate_all_sessions(user.id).await?;

        audit_log(&AuditEvent::UserDeactivated {
            user_id: user.id,
            actor: Some(actor.user_id),
        });
        Ok(())
    }

    async fn find_role(&self, tenant_id: Uuid, org_id: Option<Uuid>, name: &str) -> Result<Role> {
        self.guard
            .call(
                "find_role",
                self.store.find_role(tenant_id, org_id, name.trim()),
            )
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// A user in the actor's tenant; anything else looks absent
    async fn tenant_user(&self, actor: &Claims, user_id: Uuid) -> Result<User> {
        self.guard
            .call("find_user", self.store.find_user(user_id))
            .await?
            .filter(|u| u.tenant_id == actor.tenant_id)
            .ok_or(AuthError::NotFound)
    }

    // ========================================================================
    // Permission catalog and maintenance
    // ========================================================================

    /// Record every permission named by `registry` in the catalog
    pub async fn seed_permissions(&self, registry: &PermissionRegistry) -> Result<usize> {
        let names = registry.permission_names();
        for name in &names {
            let description = format!("Required by {}", registry.service());
            self.guard
                .call(
                    "upsert_permission",
                    self.store
                        .upsert_permission(Permission::new(*name, description)),
                )
                .await?;
        }
        Ok(names.len())
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>> {
        self.guard
            .call("list_permissions", self.store.list_permissions())
            .await
    }

    pub async fn sweep_expired(&self) -> Result<u64> {
        let purged = self.issuer.sweep_expired().await?;
        if purged > 0 {
            info!(purged, "Expired credentials purged");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::notifier::RecordingNotifier;
    use crate::auth::store::{DirectoryStore, MemoryStore};
    use authz_core::{Membership, SUPER_ADMIN_ROLE};

    const PASSWORD: &str = "Correct#Horse9";

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        service: IdentityService,
        tenant: Uuid,
    }

    fn test_config() -> AuthConfig {
        AuthConfig {
            hash_memory_kib: 8,
            hash_iterations: 1,
            hash_parallelism: 1,
            store_timeout_ms: 500,
            ..AuthConfig::default()
        }
    }

    fn fixture_with(config: AuthConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Arc::new(RecordingNotifier::new());
        let service = IdentityService::new(store.clone(), notifier.clone(), clock.clone(), &config);
        Fixture {
            store,
            clock,
            notifier,
            service,
            tenant: Uuid::new_v4(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config())
    }

    /// Claims of a super admin of `tenant`, as the interceptor would attach them
    fn admin_of(tenant: Uuid) -> Claims {
        Claims {
            user_id: Uuid::new_v4(),
            tenant_id: tenant,
            org_id: None,
            email: "root@x.com".to_string(),
            name: "Root".to_string(),
            roles: vec![SUPER_ADMIN_ROLE.to_string()],
            permissions: vec!["create-user".to_string()],
        }
    }

    fn register_request(email: &str, role: &str) -> RegisterRequest {
        RegisterRequest {
            name: "Alice".to_string(),
            email: email.to_string(),
            password: PASSWORD.to_string(),
            role_name: role.to_string(),
        }
    }

    impl Fixture {
        async fn register(&self, email: &str, role: &str) -> User {
            self.service
                .register(&admin_of(self.tenant), register_request(email, role))
                .await
                .unwrap()
        }

        async fn login(&self, email: &str) -> AuthGrant {
            self.service
                .login(self.tenant, email, PASSWORD, None, &ClientInfo::default())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let f = fixture();
        let user = f.register("Alice@X.com", "manager").await;
        assert_eq!(user.email, "alice@x.com");

        let grant = f.login("alice@x.com").await;
        assert_eq!(grant.claims.user_id, user.id);
        assert_eq!(grant.claims.roles, vec!["manager".to_string()]);
        assert!(grant.claims.permissions.is_empty());
        assert_eq!(grant.claims.org_id, None);

        let stored = f.store.find_user(user.id).await.unwrap().unwrap();
        assert!(stored.last_login_at.is_some());
    }

    #[tokio::test]
    async fn test_register_sends_verification() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        assert!(f
            .notifier
            .last_secret("email_verification", "alice@x.com")
            .is_some());
    }

    #[tokio::test]
    async fn test_register_survives_notification_failure() {
        let f = fixture();
        f.notifier.fail_deliveries(true);
        let user = f.register("alice@x.com", "manager").await;
        assert!(f.store.find_user(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_case_insensitive() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;

        let err = f
            .service
            .register(&admin_of(f.tenant), register_request("ALICE@x.com", "manager"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::DuplicateEmail);

        // Other tenants have their own namespace
        assert!(f
            .service
            .register(&admin_of(Uuid::new_v4()), register_request("alice@x.com", "manager"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_weak_password_rejected() {
        let f = fixture();
        let mut request = register_request("alice@x.com", "manager");
        request.password = "short".to_string();

        assert!(matches!(
            f.service.register(&admin_of(f.tenant), request).await,
            Err(AuthError::WeakInput(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_email_rejected() {
        let f = fixture();
        let request = register_request("not-an-email", "manager");
        assert!(matches!(
            f.service.register(&admin_of(f.tenant), request).await,
            Err(AuthError::WeakInput(_))
        ));
    }

    /// Caller holding `create-user` and nothing that outranks it
    fn manager_of(tenant: Uuid) -> Claims {
        Claims {
            roles: vec!["user-manager".to_string()],
            permissions: vec!["create-user".to_string()],
            ..admin_of(tenant)
        }
    }

    #[tokio::test]
    async fn test_register_lands_in_callers_tenant() {
        let f = fixture();
        let other = Uuid::new_v4();
        let user = f
            .service
            .register(&admin_of(other), register_request("alice@x.com", "manager"))
            .await
            .unwrap();
        assert_eq!(user.tenant_id, other);
        assert!(f
            .store
            .find_user_by_email(f.tenant, "alice@x.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_register_refuses_super_admin_without_it() {
        let f = fixture();
        let err = f
            .service
            .register(&manager_of(f.tenant), register_request("eve@x.com", SUPER_ADMIN_ROLE))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
        assert!(f
            .store
            .find_user_by_email(f.tenant, "eve@x.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_register_refuses_role_beyond_callers_permissions() {
        let f = fixture();
        f.store
            .create_role(Role::new(f.tenant, None, "approver").with_permissions(["delete-user"]))
            .await
            .unwrap();

        let err = f
            .service
            .register(&manager_of(f.tenant), register_request("eve@x.com", "approver"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));

        let mut holder = manager_of(f.tenant);
        holder.permissions.push("delete-user".to_string());
        assert!(f
            .service
            .register(&holder, register_request("eve@x.com", "approver"))
            .await
            .is_ok());

        // A role that does not exist yet starts empty
        assert!(f
            .service
            .register(&manager_of(f.tenant), register_request("bob@x.com", "clerk"))
            .await
            .is_ok());
    }

    fn organization_request(email: &str, organization: &str) -> RegisterOrganizationRequest {
        RegisterOrganizationRequest {
            name: "Root".to_string(),
            email: email.to_string(),
            password: PASSWORD.to_string(),
            organization_name: organization.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_organization_signs_in_super_admin() {
        let f = fixture();
        let registration = f
            .service
            .register_organization(organization_request("Root@Acme.com", "Acme"), &ClientInfo::default())
            .await
            .unwrap();

        assert!(registration.is_super_admin);
        assert_eq!(registration.organization_name, "Acme");
        assert_eq!(registration.user.email, "root@acme.com");
        assert_eq!(registration.grant.claims.org_id, Some(registration.org_id));
        assert_eq!(registration.grant.claims.tenant_id, registration.user.tenant_id);

        let claims = f
            .service
            .validate_token(&registration.grant.session_token)
            .await
            .unwrap();
        assert!(claims.has_role(SUPER_ADMIN_ROLE));

        let membership = f
            .store
            .find_membership(registration.user.id, registration.org_id)
            .await
            .unwrap()
            .unwrap();
        assert!(membership.is_current);
        assert!(f
            .notifier
            .last_secret("email_verification", "root@acme.com")
            .is_some());
    }

    #[tokio::test]
    async fn test_register_organization_gets_fresh_tenant() {
        let f = fixture();
        let first = f
            .service
            .register_organization(organization_request("a@acme.com", "Acme"), &ClientInfo::default())
            .await
            .unwrap();
        let second = f
            .service
            .register_organization(organization_request("b@globex.com", "Globex"), &ClientInfo::default())
            .await
            .unwrap();
        assert_ne!(first.user.tenant_id, second.user.tenant_id);
        assert_ne!(first.org_id, second.org_id);
    }

    #[tokio::test]
    async fn test_register_organization_validation() {
        let f = fixture();
        let short = f
            .service
            .register_organization(organization_request("a@acme.com", " AB "), &ClientInfo::default())
            .await;
        assert!(matches!(short, Err(AuthError::WeakInput(_))));

        let mut weak = organization_request("a@acme.com", "Acme");
        weak.password = "short".to_string();
        assert!(matches!(
            f.service.register_organization(weak, &ClientInfo::default()).await,
            Err(AuthError::WeakInput(_))
        ));

        f.register("taken@x.com", "manager").await;
        let taken = f
            .service
            .register_organization(organization_request("TAKEN@x.com", "Acme"), &ClientInfo::default())
            .await;
        assert_eq!(taken.unwrap_err(), AuthError::DuplicateEmail);
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        let client = ClientInfo::default();

        let unknown = f
            .service
            .login(f.tenant, "nobody@x.com", PASSWORD, None, &client)
            .await
            .unwrap_err();
        let wrong = f
            .service
            .login(f.tenant, "alice@x.com", "Wrong#Pass9", None, &client)
            .await
            .unwrap_err();

        f.store.deactivate_user(user.id, None, Utc::now()).await.unwrap();
        let inactive = f
            .service
            .login(f.tenant, "alice@x.com", PASSWORD, None, &client)
            .await
            .unwrap_err();

        assert_eq!(unknown, AuthError::InvalidCredentials);
        assert_eq!(unknown, wrong);
        assert_eq!(wrong, inactive);
        assert_eq!(unknown.to_string(), inactive.to_string());
    }

    #[tokio::test]
    async fn test_login_picks_current_membership() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        let first = Uuid::new_v4();
        let current = Uuid::new_v4();

        f.store
            .add_membership(Membership::new(user.id, first, f.tenant))
            .await
            .unwrap();
        let mut m = Membership::new(user.id, current, f.tenant);
        m.is_current = true;
        f.store.add_membership(m).await.unwrap();

        assert_eq!(f.login("alice@x.com").await.claims.org_id, Some(current));
    }

    #[tokio::test]
    async fn test_login_into_foreign_org_denied() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;

        let err = f
            .service
            .login(f.tenant, "alice@x.com", PASSWORD, Some(Uuid::new_v4()), &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_login_global_finds_tenant_by_email() {
        let f = fixture();
        let registration = f
            .service
            .register_organization(organization_request("root@acme.com", "Acme"), &ClientInfo::default())
            .await
            .unwrap();

        let grant = f
            .service
            .login_global("ROOT@acme.com", PASSWORD, None, &ClientInfo::default())
            .await
            .unwrap();
        assert_eq!(grant.claims.user_id, registration.user.id);
        assert_eq!(grant.claims.org_id, Some(registration.org_id));
    }

    #[tokio::test]
    async fn test_login_global_failures() {
        let f = fixture();
        f.service
            .register_organization(organization_request("root@acme.com", "Acme"), &ClientInfo::default())
            .await
            .unwrap();
        let client = ClientInfo::default();

        let unknown = f
            .service
            .login_global("nobody@acme.com", PASSWORD, None, &client)
            .await
            .unwrap_err();
        let wrong = f
            .service
            .login_global("root@acme.com", "Wrong#Pass9", None, &client)
            .await
            .unwrap_err();
        assert_eq!(unknown, AuthError::InvalidCredentials);
        assert_eq!(unknown, wrong);

        // Accounts outside any organization cannot use the tenant-less login
        f.register("alice@x.com", "manager").await;
        let orphan = f
            .service
            .login_global("alice@x.com", PASSWORD, None, &client)
            .await
            .unwrap_err();
        assert!(matches!(orphan, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_login_global_requires_verified_email_for_members() {
        let mut config = test_config();
        config.require_verified_email = true;
        let f = fixture_with(config);
        let user = f.register("alice@x.com", "manager").await;
        let org = Uuid::new_v4();
        f.store
            .add_membership(Membership::new(user.id, org, f.tenant))
            .await
            .unwrap();

        let err = f
            .service
            .login_global("alice@x.com", PASSWORD, None, &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));

        // The organization's founder is a super admin and needs no verification
        f.service
            .register_organization(organization_request("root@acme.com", "Acme"), &ClientInfo::default())
            .await
            .unwrap();
        assert!(f
            .service
            .login_global("root@acme.com", PASSWORD, None, &ClientInfo::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_require_verified_email() {
        let mut config = test_config();
        config.require_verified_email = true;
        let f = fixture_with(config);
        let user = f.register("alice@x.com", "manager").await;

        let err = f
            .service
            .login(f.tenant, "alice@x.com", PASSWORD, None, &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));

        let token = f
            .notifier
            .last_secret("email_verification", "alice@x.com")
            .unwrap();
        f.service.verify_email(user.id, &token).await.unwrap();
        f.login("alice@x.com").await;
    }

    #[tokio::test]
    async fn test_super_admin_exempt_from_verification() {
        let mut config = test_config();
        config.require_verified_email = true;
        let f = fixture_with(config);
        f.register("root@x.com", "SUPER_ADMIN").await;
        f.login("root@x.com").await;
    }

    #[tokio::test]
    async fn test_claims_rederived_on_refresh() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;
        assert!(!grant.claims.has_permission("create-role"));

        let role = f
            .store
            .find_role(f.tenant, None, "manager")
            .await
            .unwrap()
            .unwrap();
        f.store.grant_permission(role.id, "create-role").await.unwrap();

        // The existing session still carries what it was issued with
        let current = f.service.validate_token(&grant.session_token).await.unwrap();
        assert!(!current.has_permission("create-role"));

        let refreshed = f
            .service
            .refresh(&grant.refresh_token, f.tenant, None)
            .await
            .unwrap();
        assert!(refreshed.claims.has_permission("create-role"));
        assert_eq!(refreshed.refresh_token, grant.refresh_token);

        let validated = f
            .service
            .validate_token(&refreshed.session_token)
            .await
            .unwrap();
        assert!(validated.has_permission("create-role"));

        // Older sessions are not revoked by a refresh
        assert!(f.service.validate_token(&grant.session_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_rejects_foreign_tenant_and_garbage() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        assert_eq!(
            f.service
                .refresh(&grant.refresh_token, Uuid::new_v4(), None)
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );
        assert_eq!(
            f.service.refresh("garbage", f.tenant, None).await.unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_expired_refresh_token() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        f.clock.set(grant.refresh_expires_at);
        assert_eq!(
            f.service
                .refresh(&grant.refresh_token, f.tenant, None)
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_session_expiry_boundary() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        f.clock
            .set(grant.session_expires_at - chrono::Duration::milliseconds(1));
        assert!(f.service.validate_token(&grant.session_token).await.is_ok());

        f.clock.set(grant.session_expires_at);
        assert_eq!(
            f.service
                .validate_token(&grant.session_token)
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_logout_is_immediate_and_idempotent() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        f.service
            .logout(&grant.session_token, Some(&grant.refresh_token))
            .await
            .unwrap();

        assert_eq!(
            f.service
                .validate_token(&grant.session_token)
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );
        assert!(f
            .service
            .refresh(&grant.refresh_token, f.tenant, None)
            .await
            .is_err());

        f.service
            .logout(&grant.session_token, Some(&grant.refresh_token))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tampered_token_rejected() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        let mut tampered = grant.session_token.clone();
        tampered.push('x');
        assert_eq!(
            f.service.validate_token(&tampered).await.unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_invalidate_all_sessions() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        let first = f.login("alice@x.com").await;
        let second = f.login("alice@x.com").await;

        assert_eq!(f.service.get_active_sessions(user.id).await.unwrap().len(), 2);
        assert_eq!(f.service.invalidate_all_sessions(user.id).await.unwrap(), 2);

        assert!(f.service.validate_token(&first.session_token).await.is_err());
        assert!(f.service.validate_token(&second.session_token).await.is_err());
        assert!(f.service.get_active_sessions(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_sessions_skip_expired() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        f.clock.set(grant.session_expires_at);
        assert!(f.service.get_active_sessions(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forgot_password_unknown_email_is_silent() {
        let f = fixture();
        f.service
            .forgot_password(f.tenant, "nobody@x.com")
            .await
            .unwrap();
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reset_token_rejected_for_deactivated_user() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        f.service.forgot_password(f.tenant, "alice@x.com").await.unwrap();
        let token = f
            .notifier
            .last_secret("password_reset", "alice@x.com")
            .unwrap();

        f.store.deactivate_user(user.id, None, Utc::now()).await.unwrap();
        assert_eq!(
            f.service
                .reset_password_by_token(&token, "Brand#New9pass")
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );

        let stored = f.store.find_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.password_hash, user.password_hash);
    }

    #[tokio::test]
    async fn test_password_reset_token_single_use() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        f.service.forgot_password(f.tenant, "alice@x.com").await.unwrap();
        let token = f
            .notifier
            .last_secret("password_reset", "alice@x.com")
            .unwrap();

        f.service
            .reset_password_by_token(&token, "Brand#New9pass")
            .await
            .unwrap();
        assert_eq!(
            f.service
                .reset_password_by_token(&token, "Other#New9pass")
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );

        assert!(f
            .service
            .login(f.tenant, "alice@x.com", "Brand#New9pass", None, &ClientInfo::default())
            .await
            .is_ok());
        assert_eq!(
            f.service
                .login(f.tenant, "alice@x.com", PASSWORD, None, &ClientInfo::default())
                .await
                .unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn test_reset_keeps_sessions_by_default() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        f.service.forgot_password(f.tenant, "alice@x.com").await.unwrap();
        let token = f.notifier.last_secret("password_reset", "alice@x.com").unwrap();
        f.service.reset_password_by_token(&token, "Brand#New9pass").await.unwrap();

        assert!(f.service.validate_token(&grant.session_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_revokes_sessions_when_configured() {
        let mut config = test_config();
        config.revoke_sessions_on_password_reset = true;
        let f = fixture_with(config);
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        f.service.forgot_password(f.tenant, "alice@x.com").await.unwrap();
        let token = f.notifier.last_secret("password_reset", "alice@x.com").unwrap();
        f.service.reset_password_by_token(&token, "Brand#New9pass").await.unwrap();

        assert!(f.service.validate_token(&grant.session_token).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_rejects_weak_password_without_consuming() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        f.service.forgot_password(f.tenant, "alice@x.com").await.unwrap();
        let token = f.notifier.last_secret("password_reset", "alice@x.com").unwrap();

        assert!(matches!(
            f.service.reset_password_by_token(&token, "weak").await,
            Err(AuthError::WeakInput(_))
        ));
        assert!(f
            .service
            .reset_password_by_token(&token, "Brand#New9pass")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_token() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        f.notifier.fail_deliveries(true);

        let err = f
            .service
            .forgot_password(f.tenant, "alice@x.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotificationFailed(_)));
        assert!(f
            .notifier
            .sent()
            .iter()
            .any(|n| n.kind == "email_update" && n.email == "alice@x.com"));

        let token = f.notifier.last_secret("password_reset", "alice@x.com").unwrap();
        assert!(f
            .service
            .reset_password_by_token(&token, "Brand#New9pass")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_otp_reset_flow() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        f.service
            .forgot_password_with_otp(f.tenant, "alice@x.com")
            .await
            .unwrap();
        let code = f
            .notifier
            .last_secret("password_reset_otp", "alice@x.com")
            .unwrap();

        assert_eq!(
            f.service
                .reset_password_with_otp(f.tenant, "bob@x.com", &code, "Brand#New9pass")
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        );

        f.service
            .reset_password_with_otp(f.tenant, "alice@x.com", &code, "Brand#New9pass")
            .await
            .unwrap();
        assert!(f
            .service
            .reset_password_with_otp(f.tenant, "alice@x.com", &code, "Other#New9pass")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_verify_email_requires_owner() {
        let f = fixture();
        let alice = f.register("alice@x.com", "manager").await;
        let bob = f.register("bob@x.com", "manager").await;
        let token = f
            .notifier
            .last_secret("email_verification", "alice@x.com")
            .unwrap();

        assert_eq!(
            f.service.verify_email(bob.id, &token).await.unwrap_err(),
            AuthError::InvalidToken
        );

        f.service.verify_email(alice.id, &token).await.unwrap();
        assert!(f
            .store
            .find_user(alice.id)
            .await
            .unwrap()
            .unwrap()
            .is_email_verified());

        assert_eq!(
            f.service.verify_email(alice.id, &token).await.unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_send_verification_silent_for_unknown_and_settled() {
        let f = fixture();
        f.service.send_verification_email(Uuid::new_v4()).await.unwrap();
        assert!(f.notifier.sent().is_empty());

        let user = f.register("alice@x.com", "manager").await;
        let token = f
            .notifier
            .last_secret("email_verification", "alice@x.com")
            .unwrap();
        f.service.verify_email(user.id, &token).await.unwrap();
        let before = f.notifier.sent().len();

        f.service.send_verification_email(user.id).await.unwrap();
        assert_eq!(f.notifier.sent().len(), before);
    }

    #[tokio::test]
    async fn test_resent_verification_supersedes() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        let first = f
            .notifier
            .last_secret("email_verification", "alice@x.com")
            .unwrap();

        f.service.send_verification_email(user.id).await.unwrap();
        let second = f
            .notifier
            .last_secret("email_verification", "alice@x.com")
            .unwrap();

        assert!(f.service.verify_email(user.id, &first).await.is_err());
        assert!(f.service.verify_email(user.id, &second).await.is_ok());
    }

    #[tokio::test]
    async fn test_switch_organization() {
        let f = fixture();
        let user = f.register("alice@x.com", "manager").await;
        let org = Uuid::new_v4();
        f.store
            .add_membership(Membership::new(user.id, org, f.tenant))
            .await
            .unwrap();

        let grant = f
            .service
            .login(f.tenant, "alice@x.com", PASSWORD, None, &ClientInfo::default())
            .await
            .unwrap();
        let other_session = f.login("alice@x.com").await;

        let switched = f
            .service
            .switch_organization(&grant.claims, &grant.session_token, org)
            .await
            .unwrap();
        assert_eq!(switched.claims.org_id, Some(org));

        assert!(f.service.validate_token(&grant.session_token).await.is_err());
        assert!(f.service.validate_token(&switched.session_token).await.is_ok());
        assert!(f
            .service
            .validate_token(&other_session.session_token)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_switch_to_foreign_org_denied() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        let grant = f.login("alice@x.com").await;

        let err = f
            .service
            .switch_organization(&grant.claims, &grant.session_token, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
        assert!(f.service.validate_token(&grant.session_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_role_administration() {
        let f = fixture();
        f.register("admin@x.com", "SUPER_ADMIN").await;
        let bob = f.register("bob@x.com", "viewer").await;
        let admin = f.login("admin@x.com").await.claims;

        f.service
            .create_role(
                &admin,
                CreateRoleRequest {
                    name: "approver".to_string(),
                    description: None,
                    org_id: None,
                    permissions: vec!["approve-note".to_string()],
                },
            )
            .await
            .unwrap();
        let role = f
            .service
            .grant_role_permission(
                &admin,
                GrantPermissionRequest {
                    role_name: "approver".to_string(),
                    org_id: None,
                    permission: "reject-note".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(role.permissions, vec!["approve-note", "reject-note"]);

        f.service
            .assign_role(
                &admin,
                AssignRoleRequest {
                    user_id: bob.id,
                    role_name: "approver".to_string(),
                    org_id: None,
                },
            )
            .await
            .unwrap();

        let claims = f.login("bob@x.com").await.claims;
        assert!(claims.has_role("approver"));
        assert!(claims.has_permission("reject-note"));
    }

    #[tokio::test]
    async fn test_duplicate_role_rejected() {
        let f = fixture();
        f.register("admin@x.com", "SUPER_ADMIN").await;
        let admin = f.login("admin@x.com").await.claims;
        let request = CreateRoleRequest {
            name: "approver".to_string(),
            description: None,
            org_id: None,
            permissions: vec![],
        };

        f.service.create_role(&admin, request.clone()).await.unwrap();
        assert!(matches!(
            f.service.create_role(&admin, request).await,
            Err(AuthError::WeakInput(_))
        ));
    }

    #[tokio::test]
    async fn test_role_admin_cannot_delegate_beyond_own_permissions() {
        let f = fixture();
        let bob = f.register("bob@x.com", "viewer").await;
        let mut operator = manager_of(f.tenant);
        operator.permissions = ["create-role", "edit-role", "edit-user"]
            .map(str::to_string)
            .to_vec();

        let create = |permissions: Vec<&str>| CreateRoleRequest {
            name: "approver".to_string(),
            description: None,
            org_id: None,
            permissions: permissions.into_iter().map(str::to_string).collect(),
        };
        assert!(matches!(
            f.service.create_role(&operator, create(vec!["delete-user"])).await,
            Err(AuthError::AccessDenied(_))
        ));
        f.service
            .create_role(&operator, create(vec!["edit-user"]))
            .await
            .unwrap();

        let grant = f
            .service
            .grant_role_permission(
                &operator,
                GrantPermissionRequest {
                    role_name: "approver".to_string(),
                    org_id: None,
                    permission: "delete-user".to_string(),
                },
            )
            .await;
        assert!(matches!(grant, Err(AuthError::AccessDenied(_))));

        f.register("root@x.com", SUPER_ADMIN_ROLE).await;
        let assign = f
            .service
            .assign_role(
                &operator,
                AssignRoleRequest {
                    user_id: bob.id,
                    role_name: SUPER_ADMIN_ROLE.to_string(),
                    org_id: None,
                },
            )
            .await;
        assert!(matches!(assign, Err(AuthError::AccessDenied(_))));
        assert!(!f.login("bob@x.com").await.claims.has_role(SUPER_ADMIN_ROLE));
    }

    #[tokio::test]
    async fn test_admin_cannot_reach_other_tenant() {
        let f = fixture();
        f.register("admin@x.com", "SUPER_ADMIN").await;
        let admin = f.login("admin@x.com").await.claims;
        let (outsider, _) = f
            .store
            .register_user(User::new(Uuid::new_v4(), "Eve", "eve@y.com", "hash"), "viewer")
            .await
            .unwrap();

        assert_eq!(
            f.service.deactivate_user(&admin, outsider.id).await.unwrap_err(),
            AuthError::NotFound
        );
    }

    #[tokio::test]
    async fn test_deactivation_ends_sessions() {
        let f = fixture();
        f.register("admin@x.com", "SUPER_ADMIN").await;
        let bob = f.register("bob@x.com", "viewer").await;
        let admin = f.login("admin@x.com").await.claims;
        let bob_grant = f.login("bob@x.com").await;

        f.service.deactivate_user(&admin, bob.id).await.unwrap();

        assert!(f.service.validate_token(&bob_grant.session_token).await.is_err());
        assert_eq!(
            f.service
                .login(f.tenant, "bob@x.com", PASSWORD, None, &ClientInfo::default())
                .await
                .unwrap_err(),
            AuthError::InvalidCredentials
        );
        let stored = f.store.find_user(bob.id).await.unwrap().unwrap();
        assert_eq!(stored.deactivated_by, Some(admin.user_id));
    }

    #[tokio::test]
    async fn test_seed_permissions() {
        let f = fixture();
        let registry = crate::auth::registry::catalog::auth_service();
        let seeded = f.service.seed_permissions(&registry).await.unwrap();

        let names: Vec<String> = f
            .service
            .list_permissions()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names.len(), seeded);
        assert!(names.contains(&"switch-organizations".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        f.login("alice@x.com").await;

        f.clock.advance(chrono::Duration::days(30));
        assert!(f.service.sweep_expired().await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_storage_outage_is_retryable() {
        let f = fixture();
        f.register("alice@x.com", "manager").await;
        f.store.set_latency(Some(Duration::from_secs(5)));

        let err = f
            .service
            .login(f.tenant, "alice@x.com", PASSWORD, None, &ClientInfo::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}

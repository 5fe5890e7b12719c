//! Access interceptor
//!
//! Runs in front of every RPC. For an operation name and the raw
//! `authorization` header it decides, in order:
//!
//! 1. public operations pass untouched, without claims
//! 2. a missing or blank bearer value is `Unauthenticated`
//! 3. the token must validate against a live session
//! 4. callers holding the super-admin role skip the permission check
//! 5. otherwise the caller needs at least one permission the registry lists
//! 6. the verified claims are attached to the request
//!
//! Handlers read those claims only through the [`Caller`] extractor.

use super::registry::{PermissionRegistry, Requirement};
use super::service::IdentityService;
use crate::audit::{audit_log, extract_ip_address, AuditEvent};
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use authz_core::{AuthError, Claims, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bearer value from an `authorization` header, with or without the
/// `Bearer ` prefix. Blank values count as absent.
pub fn extract_bearer(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let token = match value.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer") && value.len() == 6 => "",
        _ => match value.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim_start(),
            _ => value,
        },
    };
    (!token.is_empty()).then_some(token)
}

pub struct AccessInterceptor {
    service: Arc<IdentityService>,
    registry: Arc<PermissionRegistry>,
    super_admin_role: String,
}

impl AccessInterceptor {
    pub fn new(
        service: Arc<IdentityService>,
        registry: Arc<PermissionRegistry>,
        super_admin_role: impl Into<String>,
    ) -> Self {
        Self {
            service,
            registry,
            super_admin_role: super_admin_role.into(),
        }
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    /// Decide one call. `Ok(None)` means the operation is public.
    pub async fn authorize(
        &self,
        operation: &str,
        authorization: Option<&str>,
    ) -> Result<Option<Claims>> {
        self.authorize_from(operation, authorization, None).await
    }

    async fn authorize_from(
        &self,
        operation: &str,
        authorization: Option<&str>,
        ip_address: Option<String>,
    ) -> Result<Option<Claims>> {
        let requirement = self.registry.requirement(operation);
        if requirement == Requirement::Public {
            return Ok(None);
        }

        let token = extract_bearer(authorization).ok_or_else(|| {
            debug!(operation, "Missing bearer token");
            AuthError::Unauthenticated
        })?;

        let claims = match self.service.validate_token(token).await {
            Ok(claims) => claims,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                audit_log(&AuditEvent::InvalidToken {
                    operation: operation.to_string(),
                    reason: e.to_string(),
                    ip_address,
                });
                return Err(AuthError::Unauthenticated);
            }
        };

        if claims.has_role(&self.super_admin_role) {
            return Ok(Some(claims));
        }

        if let Requirement::AnyOf(required) = requirement {
            if !claims.holds_any(required) {
                let required: Vec<String> = required.iter().cloned().collect();
                warn!(
                    user_id = %claims.user_id,
                    operation,
                    required = ?required,
                    "Permission denied"
                );
                audit_log(&AuditEvent::PermissionDenied {
                    user_id: claims.user_id,
                    operation: operation.to_string(),
                    required: required.clone(),
                    ip_address,
                });
                return Err(AuthError::PermissionDenied { required });
            }
        }

        Ok(Some(claims))
    }
}

/// Authorize the request against its path and attach the caller's claims
///
/// # Usage
///
/// ```ignore
/// let app = Router::new()
///     .route("/AuthService/SwitchOrganization", post(switch_organization))
///     .layer(middleware::from_fn_with_state(state.clone(), access_middleware))
///     .with_state(state);
/// ```
pub async fn access_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, AppError> {
    let operation = request.uri().path().to_string();
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ip_address = extract_ip_address(request.headers());

    let claims = state
        .interceptor
        .authorize_from(&operation, authorization.as_deref(), ip_address)
        .await?;

    if let Some(claims) = claims {
        request.extensions_mut().insert(claims);
    }

    Ok(next.run(request).await)
}

/// Verified claims of the current caller
///
/// Rejects with `Unauthenticated` when the interceptor attached none, which
/// only happens on public operations.
#[derive(Debug, Clone)]
pub struct Caller(pub Claims);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(Caller)
            .ok_or_else(|| AuthError::Unauthenticated.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::models::ClientInfo;
    use crate::auth::notifier::RecordingNotifier;
    use crate::auth::store::{DirectoryStore, MemoryStore};
    use authz_core::{AuthConfig, User};
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    const PASSWORD: &str = "Correct#Horse9";

    struct Fixture {
        store: Arc<MemoryStore>,
        service: Arc<IdentityService>,
        interceptor: AccessInterceptor,
        tenant: Uuid,
    }

    fn fixture() -> Fixture {
        let config = AuthConfig {
            hash_memory_kib: 8,
            hash_iterations: 1,
            hash_parallelism: 1,
            store_timeout_ms: 200,
            ..AuthConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(IdentityService::new(
            store.clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(ManualClock::new(Utc::now())),
            &config,
        ));
        let registry = PermissionRegistry::builder("Sample")
            .require("opA", ["p1", "p2"])
            .public("opB")
            .build();

        Fixture {
            interceptor: AccessInterceptor::new(service.clone(), Arc::new(registry), "SUPER_ADMIN"),
            store,
            service,
            tenant: Uuid::new_v4(),
        }
    }

    impl Fixture {
        /// Session token for a fresh user whose only role grants `permissions`
        async fn session_with(&self, role: &str, permissions: &[&str]) -> String {
            let email = format!("{}@x.com", Uuid::new_v4().simple());
            let hash = self.service.issuer().hash_password(PASSWORD).await.unwrap();
            let (_, role) = self
                .store
                .register_user(User::new(self.tenant, "Caller", &email, hash), role)
                .await
                .unwrap();
            for permission in permissions {
                self.store.grant_permission(role.id, permission).await.unwrap();
            }

            self.service
                .login(self.tenant, &email, PASSWORD, None, &ClientInfo::default())
                .await
                .unwrap()
                .session_token
        }
    }

    #[tokio::test]
    async fn test_public_operation_needs_no_token() {
        let f = fixture();
        assert_eq!(f.interceptor.authorize("opB", None).await.unwrap(), None);
        assert_eq!(
            f.interceptor
                .authorize("opB", Some("Bearer garbage"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let f = fixture();
        for header in [None, Some(""), Some("Bearer "), Some("   ")] {
            assert_eq!(
                f.interceptor.authorize("opA", header).await.unwrap_err(),
                AuthError::Unauthenticated,
                "{header:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_token_is_unauthenticated() {
        let f = fixture();
        assert_eq!(
            f.interceptor
                .authorize("opA", Some("Bearer not-a-token"))
                .await
                .unwrap_err(),
            AuthError::Unauthenticated
        );
    }

    #[tokio::test]
    async fn test_any_listed_permission_suffices() {
        let f = fixture();
        let token = f.session_with("reviewer", &["p2"]).await;

        let claims = f
            .interceptor
            .authorize("opA", Some(format!("Bearer {token}").as_str()))
            .await
            .unwrap()
            .unwrap();
        assert!(claims.has_permission("p2"));
    }

    #[tokio::test]
    async fn test_prefix_is_optional() {
        let f = fixture();
        let token = f.session_with("reviewer", &["p1"]).await;
        assert!(f.interceptor.authorize("opA", Some(token.as_str())).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_permission_denied() {
        let f = fixture();
        let token = f.session_with("viewer", &["p3"]).await;

        match f.interceptor.authorize("opA", Some(token.as_str())).await {
            Err(AuthError::PermissionDenied { required }) => {
                assert_eq!(required, vec!["p1".to_string(), "p2".to_string()]);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_super_admin_bypasses_permissions() {
        let f = fixture();
        let token = f.session_with("SUPER_ADMIN", &[]).await;
        assert!(f.interceptor.authorize("opA", Some(token.as_str())).await.is_ok());
    }

    #[tokio::test]
    async fn test_unlisted_operation_admits_any_caller() {
        let f = fixture();
        let token = f.session_with("viewer", &[]).await;

        let claims = f
            .interceptor
            .authorize("opUnlisted", Some(token.as_str()))
            .await
            .unwrap();
        assert!(claims.is_some());

        assert_eq!(
            f.interceptor.authorize("opUnlisted", None).await.unwrap_err(),
            AuthError::Unauthenticated
        );
    }

    #[tokio::test]
    async fn test_revoked_session_rejected() {
        let f = fixture();
        let token = f.session_with("reviewer", &["p1"]).await;
        f.service.logout(&token, None).await.unwrap();

        assert_eq!(
            f.interceptor.authorize("opA", Some(token.as_str())).await.unwrap_err(),
            AuthError::Unauthenticated
        );
    }

    #[tokio::test]
    async fn test_storage_outage_passes_through() {
        let f = fixture();
        let token = f.session_with("reviewer", &["p1"]).await;
        f.store
            .set_latency(Some(std::time::Duration::from_secs(5)));

        let err = f
            .interceptor
            .authorize("opA", Some(token.as_str()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_caller_reads_attached_claims() {
        let user = authz_core::User::new(Uuid::new_v4(), "Caller", "caller@x.com", "hash");
        let claims = Claims::derive(&user, None, &[]);

        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        let missing = tokio_test::block_on(Caller::from_request_parts(&mut parts, &()));
        assert!(missing.is_err());

        parts.extensions.insert(claims.clone());
        let Caller(found) =
            tokio_test::block_on(Caller::from_request_parts(&mut parts, &())).unwrap();
        assert_eq!(found, claims);
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_bearer(Some("bearer abc")), Some("abc"));
        assert_eq!(extract_bearer(Some("abc")), Some("abc"));
        assert_eq!(extract_bearer(Some("Bearer   ")), None);
        assert_eq!(extract_bearer(None), None);
    }

    proptest! {
        #[test]
        fn prop_prefix_does_not_change_token(token in "[A-Za-z0-9._-]{1,64}") {
            let prefixed = format!("Bearer {token}");
            prop_assert_eq!(extract_bearer(Some(prefixed.as_str())), Some(token.as_str()));
            prop_assert_eq!(extract_bearer(Some(token.as_str())), Some(token.as_str()));
        }

        #[test]
        fn prop_whitespace_is_never_a_token(blank in "[ \t]{0,16}") {
            prop_assert_eq!(extract_bearer(Some(blank.as_str())), None);
            let prefixed = format!("Bearer {blank}");
            prop_assert_eq!(extract_bearer(Some(prefixed.as_str())), None);
        }
    }
}

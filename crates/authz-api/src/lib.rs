//! Authz API - identity service and access interceptor over HTTP
//!
//! Exposes the AuthService RPC methods as `POST /AuthService/{Method}` and
//! puts every call through the access interceptor before its handler runs.

pub mod audit;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

use crate::auth::models::{
    AssignRoleRequest, AuthResponse, ClaimsResponse, CreateRoleRequest, DeactivateUserRequest,
    ForgotPasswordRequest, GlobalLoginRequest, GrantPermissionRequest, LoginRequest,
    LogoutRequest, MessageResponse, OtpResetRequest, RefreshRequest, RegisterOrganizationRequest,
    RegisterRequest, RegistrationResponse, ResetPasswordRequest, SendVerificationEmailRequest,
    SessionInfo, SwitchOrganizationRequest, UserResponse, ValidateTokenRequest,
    VerifyEmailRequest,
};
use crate::handlers::auth::{InvalidateSessionsResponse, PermissionResponse, RoleResponse};
use crate::handlers::health::{self, HealthResponse, ReadinessResponse};
use crate::state::AppState;
use axum::{http::HeaderValue, middleware as axum_middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Authz API",
        description = "Authentication, session and RBAC authorization service"
    ),
    paths(
        health::health_check,
        health::readiness_check,
        handlers::auth::register_handler,
        handlers::auth::register_organization_handler,
        handlers::auth::login_handler,
        handlers::auth::login_global_handler,
        handlers::auth::logout_handler,
        handlers::auth::refresh_handler,
        handlers::auth::validate_token_handler,
        handlers::auth::invalidate_all_sessions_handler,
        handlers::auth::active_sessions_handler,
        handlers::auth::forgot_password_handler,
        handlers::auth::forgot_password_otp_handler,
        handlers::auth::reset_password_otp_handler,
        handlers::auth::reset_password_handler,
        handlers::auth::send_verification_handler,
        handlers::auth::verify_email_handler,
        handlers::auth::switch_organization_handler,
        handlers::auth::create_role_handler,
        handlers::auth::grant_permission_handler,
        handlers::auth::assign_role_handler,
        handlers::auth::deactivate_user_handler,
        handlers::auth::list_permissions_handler,
    ),
    components(schemas(
        error::ApiError,
        HealthResponse,
        ReadinessResponse,
        RegisterRequest,
        RegisterOrganizationRequest,
        LoginRequest,
        GlobalLoginRequest,
        LogoutRequest,
        RefreshRequest,
        ValidateTokenRequest,
        ForgotPasswordRequest,
        OtpResetRequest,
        ResetPasswordRequest,
        SendVerificationEmailRequest,
        VerifyEmailRequest,
        SwitchOrganizationRequest,
        CreateRoleRequest,
        GrantPermissionRequest,
        AssignRoleRequest,
        DeactivateUserRequest,
        AuthResponse,
        ClaimsResponse,
        UserResponse,
        RegistrationResponse,
        MessageResponse,
        SessionInfo,
        RoleResponse,
        PermissionResponse,
        InvalidateSessionsResponse,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Registration, sessions and recovery"),
        (name = "roles", description = "Role and permission administration"),
        (name = "health", description = "Probes")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Full application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::prometheus_metrics))
        .merge(routes::auth_service_routes(state.clone()))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::metrics_middleware,
        ))
        .layer(axum_middleware::from_fn(
            middleware::security_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    if state.config.server.cors_enabled {
        router = router.layer(cors_layer(&state));
    }

    router.with_state(state)
}

/// Router over an in-memory store with the built-in AuthService table and
/// fast password hashing
#[cfg(feature = "test-utils")]
pub fn create_router_for_testing() -> Router {
    create_test_app().router
}

/// Router plus handles tests use to look behind it
#[cfg(feature = "test-utils")]
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub notifier: Arc<crate::auth::notifier::RecordingNotifier>,
}

#[cfg(feature = "test-utils")]
pub fn create_test_app() -> TestApp {
    use crate::auth::notifier::RecordingNotifier;
    use crate::auth::{registry::catalog, IdentityService, MemoryStore, SystemClock};
    use authz_core::AppConfig;

    let mut config = AppConfig::default();
    config.auth.hash_memory_kib = 8;
    config.auth.hash_iterations = 1;
    config.auth.hash_parallelism = 1;

    let notifier = Arc::new(RecordingNotifier::new());
    let service = Arc::new(IdentityService::new(
        Arc::new(MemoryStore::new()),
        notifier.clone(),
        Arc::new(SystemClock),
        &config.auth,
    ));
    let state = Arc::new(AppState::new(
        config,
        service,
        Arc::new(catalog::auth_service()),
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        notifier,
    }
}

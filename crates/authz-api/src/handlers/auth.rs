//! AuthService RPC handlers
//!
//! Every method is `POST /AuthService/{Method}` with a JSON body. The access
//! interceptor has already run by the time a handler is entered; handlers
//! that need the caller take a [`Caller`].
//!
//! Author: hephaex@gmail.com

use crate::audit::{extract_ip_address, extract_user_agent};
use crate::auth::interceptor::{extract_bearer, Caller};
use crate::auth::models::{
    AssignRoleRequest, AuthResponse, ClaimsResponse, ClientInfo, CreateRoleRequest,
    DeactivateUserRequest, ForgotPasswordRequest, GlobalLoginRequest, GrantPermissionRequest,
    LoginRequest, LogoutRequest, MessageResponse, OtpResetRequest, RefreshRequest,
    RegisterOrganizationRequest, RegisterRequest, RegistrationResponse, ResetPasswordRequest,
    SendVerificationEmailRequest, SessionInfo, SwitchOrganizationRequest, UserResponse,
    ValidateTokenRequest, VerifyEmailRequest,
};
use crate::error::AppError;
use crate::state::AppState;
use authz_core::{AuthError, Permission, Role};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoleResponse {
    pub id: Uuid,
    pub name: String,
    pub org_id: Option<Uuid>,
    pub description: Option<String>,
    pub permissions: Vec<String>,
}

impl From<Role> for RoleResponse {
    fn from(role: Role) -> Self {
        Self {
            id: role.id,
            name: role.name,
            org_id: role.org_id,
            description: role.description,
            permissions: role.permissions,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PermissionResponse {
    pub name: String,
    pub description: String,
}

impl From<Permission> for PermissionResponse {
    fn from(permission: Permission) -> Self {
        Self {
            name: permission.name,
            description: permission.description,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InvalidateSessionsResponse {
    pub sessions_revoked: u64,
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    ClientInfo {
        ip_address: extract_ip_address(headers),
        user_agent: extract_user_agent(headers),
    }
}

/// Raw session token the caller presented
fn presented_session(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    extract_bearer(value)
        .map(str::to_string)
        .ok_or(AppError::Auth(AuthError::Unauthenticated))
}

// ============================================================================
// Registration and sessions
// ============================================================================

/// Register a new user in the caller's tenant
///
/// The user receives the named tenant-wide role, created on first use, and
/// a verification email. Roles carrying privileges the caller lacks are
/// refused.
#[utoipa::path(
    post,
    path = "/AuthService/Register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = UserResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 401, description = "Authentication required", body = crate::error::ApiError),
        (status = 403, description = "Role exceeds the caller's privileges", body = crate::error::ApiError),
        (status = 409, description = "Email already registered", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.service.register(&claims, request).await?;
    Ok((StatusCode::CREATED, Json(UserResponse::from(user.to_public()))))
}

/// Sign up a new organization with its first, super admin, user
///
/// Creates a fresh tenant and signs the user straight in.
#[utoipa::path(
    post,
    path = "/AuthService/RegisterUserWithOrganization",
    tag = "auth",
    request_body = RegisterOrganizationRequest,
    responses(
        (status = 201, description = "Organization registered", body = RegistrationResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 409, description = "Email already registered", body = crate::error::ApiError),
    )
)]
pub async fn register_organization_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let registration = state
        .service
        .register_organization(request, &client_info(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(RegistrationResponse::from(registration))))
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/AuthService/Login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ApiError),
        (status = 403, description = "Organization or verification check failed", body = crate::error::ApiError),
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let grant = state
        .service
        .login(
            request.tenant_id,
            &request.email,
            &request.password,
            request.org_id,
            &client_info(&headers),
        )
        .await?;

    Ok(Json(AuthResponse::from_grant(grant, state.service.now())))
}

/// Login with email and password, without naming a tenant
#[utoipa::path(
    post,
    path = "/AuthService/LoginGlobal",
    tag = "auth",
    request_body = GlobalLoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ApiError),
        (status = 403, description = "No organization or email not verified", body = crate::error::ApiError),
    )
)]
pub async fn login_global_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GlobalLoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let grant = state
        .service
        .login_global(
            &request.email,
            &request.password,
            request.org_id,
            &client_info(&headers),
        )
        .await?;

    Ok(Json(AuthResponse::from_grant(grant, state.service.now())))
}

/// Exchange a refresh token for a new session
///
/// Claims reflect the caller's current roles. The refresh token is returned
/// unchanged.
#[utoipa::path(
    post,
    path = "/AuthService/RefreshToken",
    tag = "auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Session issued", body = AuthResponse),
        (status = 400, description = "Invalid or expired token", body = crate::error::ApiError),
    )
)]
pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let grant = state
        .service
        .refresh(&request.refresh_token, request.tenant_id, request.org_id)
        .await?;

    Ok(Json(AuthResponse::from_grant(grant, state.service.now())))
}

/// End the presenting session and, optionally, a refresh token
#[utoipa::path(
    post,
    path = "/AuthService/Logout",
    tag = "auth",
    request_body(content = LogoutRequest, description = "Refresh token to revoke (optional)"),
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Unauthenticated", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Caller(_claims): Caller,
    headers: HeaderMap,
    request: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let session = presented_session(&headers)?;
    let request = request.map(|Json(r)| r).unwrap_or_default();

    state
        .service
        .logout(&session, request.refresh_token.as_deref())
        .await?;

    Ok(Json(MessageResponse::new("Logged out successfully")))
}

/// Claims of a live session token
#[utoipa::path(
    post,
    path = "/AuthService/ValidateToken",
    tag = "auth",
    request_body = ValidateTokenRequest,
    responses(
        (status = 200, description = "Token is live", body = ClaimsResponse),
        (status = 400, description = "Invalid or expired token", body = crate::error::ApiError),
    )
)]
pub async fn validate_token_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidateTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let token = extract_bearer(Some(request.token.as_str())).ok_or(AuthError::InvalidToken)?;
    let claims = state.service.validate_token(token).await?;
    Ok(Json(ClaimsResponse::from(claims)))
}

/// Revoke every session and refresh token of the caller
#[utoipa::path(
    post,
    path = "/AuthService/InvalidateAllSessions",
    tag = "auth",
    responses(
        (status = 200, description = "Sessions revoked", body = InvalidateSessionsResponse),
        (status = 401, description = "Unauthenticated", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn invalidate_all_sessions_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
) -> Result<impl IntoResponse, AppError> {
    let sessions_revoked = state.service.invalidate_all_sessions(claims.user_id).await?;
    Ok(Json(InvalidateSessionsResponse { sessions_revoked }))
}

/// Live sessions of the caller
#[utoipa::path(
    post,
    path = "/AuthService/GetActiveSessions",
    tag = "auth",
    responses(
        (status = 200, description = "Active sessions", body = [SessionInfo]),
        (status = 401, description = "Unauthenticated", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn active_sessions_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
) -> Result<impl IntoResponse, AppError> {
    let sessions = state.service.get_active_sessions(claims.user_id).await?;
    Ok(Json(sessions))
}

// ============================================================================
// Password recovery and verification
// ============================================================================

/// Request a password reset link
///
/// The response is the same whether or not the address is registered.
#[utoipa::path(
    post,
    path = "/AuthService/ForgotPassword",
    tag = "auth",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Request accepted", body = MessageResponse),
        (status = 502, description = "Delivery failed", body = crate::error::ApiError),
    )
)]
pub async fn forgot_password_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForgotPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    state
        .service
        .forgot_password(request.tenant_id, &request.email)
        .await?;

    Ok(Json(MessageResponse::new(
        "If the account exists, a reset link has been sent",
    )))
}

#[utoipa::path(
    post,
    path = "/AuthService/ForgotPasswordWithOTP",
    tag = "auth",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Request accepted", body = MessageResponse),
        (status = 502, description = "Delivery failed", body = crate::error::ApiError),
    )
)]
pub async fn forgot_password_otp_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForgotPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    state
        .service
        .forgot_password_with_otp(request.tenant_id, &request.email)
        .await?;

    Ok(Json(MessageResponse::new(
        "If the account exists, a reset code has been sent",
    )))
}

#[utoipa::path(
    post,
    path = "/AuthService/VerifyOTPAndResetPassword",
    tag = "auth",
    request_body = OtpResetRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Invalid code or weak password", body = crate::error::ApiError),
    )
)]
pub async fn reset_password_otp_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OtpResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    state
        .service
        .reset_password_with_otp(
            request.tenant_id,
            &request.email,
            &request.otp,
            &request.new_password,
        )
        .await?;

    Ok(Json(MessageResponse::new("Password reset successfully")))
}

#[utoipa::path(
    post,
    path = "/AuthService/ResetPasswordByToken",
    tag = "auth",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Invalid token or weak password", body = crate::error::ApiError),
    )
)]
pub async fn reset_password_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .service
        .reset_password_by_token(&request.token, &request.new_password)
        .await?;

    Ok(Json(MessageResponse::new("Password reset successfully")))
}

#[utoipa::path(
    post,
    path = "/AuthService/SendVerificationEmail",
    tag = "auth",
    request_body = SendVerificationEmailRequest,
    responses(
        (status = 200, description = "Verification email sent if the account needs one", body = MessageResponse),
        (status = 502, description = "Delivery failed", body = crate::error::ApiError),
    )
)]
pub async fn send_verification_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendVerificationEmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.service.send_verification_email(request.user_id).await?;
    Ok(Json(MessageResponse::new("If the account needs verification, an email has been sent")))
}

#[utoipa::path(
    post,
    path = "/AuthService/VerifyEmail",
    tag = "auth",
    request_body = VerifyEmailRequest,
    responses(
        (status = 200, description = "Email verified", body = MessageResponse),
        (status = 400, description = "Invalid or expired token", body = crate::error::ApiError),
    )
)]
pub async fn verify_email_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .service
        .verify_email(request.user_id, &request.token)
        .await?;
    Ok(Json(MessageResponse::new("Email verified")))
}

// ============================================================================
// Organizations and roles
// ============================================================================

/// Move the caller's session to another organization
///
/// The presenting session is revoked and replaced.
#[utoipa::path(
    post,
    path = "/AuthService/SwitchOrganization",
    tag = "auth",
    request_body = SwitchOrganizationRequest,
    responses(
        (status = 200, description = "Switched", body = AuthResponse),
        (status = 403, description = "Not a member", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn switch_organization_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
    headers: HeaderMap,
    Json(request): Json<SwitchOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = presented_session(&headers)?;
    let grant = state
        .service
        .switch_organization(&claims, &session, request.org_id)
        .await?;

    Ok(Json(AuthResponse::from_grant(grant, state.service.now())))
}

#[utoipa::path(
    post,
    path = "/AuthService/CreateRole",
    tag = "roles",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = RoleResponse),
        (status = 400, description = "Invalid or duplicate role", body = crate::error::ApiError),
        (status = 403, description = "Permission denied", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_role_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
    Json(request): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = state.service.create_role(&claims, request).await?;
    Ok((StatusCode::CREATED, Json(RoleResponse::from(role))))
}

/// Grant a permission to a role; holders see it after their next refresh
#[utoipa::path(
    post,
    path = "/AuthService/GrantRolePermission",
    tag = "roles",
    request_body = GrantPermissionRequest,
    responses(
        (status = 200, description = "Permission granted", body = RoleResponse),
        (status = 404, description = "Unknown role", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn grant_permission_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
    Json(request): Json<GrantPermissionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = state.service.grant_role_permission(&claims, request).await?;
    Ok(Json(RoleResponse::from(role)))
}

#[utoipa::path(
    post,
    path = "/AuthService/AssignRole",
    tag = "roles",
    request_body = AssignRoleRequest,
    responses(
        (status = 200, description = "Role assigned", body = MessageResponse),
        (status = 404, description = "Unknown user or role", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn assign_role_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
    Json(request): Json<AssignRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.service.assign_role(&claims, request).await?;
    Ok(Json(MessageResponse::new("Role assigned")))
}

#[utoipa::path(
    post,
    path = "/AuthService/DeactivateUser",
    tag = "roles",
    request_body = DeactivateUserRequest,
    responses(
        (status = 200, description = "User deactivated", body = MessageResponse),
        (status = 404, description = "Unknown user", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn deactivate_user_handler(
    State(state): State<Arc<AppState>>,
    Caller(claims): Caller,
    Json(request): Json<DeactivateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.service.deactivate_user(&claims, request.user_id).await?;
    Ok(Json(MessageResponse::new("User deactivated")))
}

/// Permission catalog
#[utoipa::path(
    post,
    path = "/AuthService/ListPermissions",
    tag = "roles",
    responses(
        (status = 200, description = "Known permissions", body = [PermissionResponse]),
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_permissions_handler(
    State(state): State<Arc<AppState>>,
    Caller(_claims): Caller,
) -> Result<impl IntoResponse, AppError> {
    let permissions: Vec<PermissionResponse> = state
        .service
        .list_permissions()
        .await?
        .into_iter()
        .map(PermissionResponse::from)
        .collect();
    Ok(Json(permissions))
}

//! API route definitions
//!
//! Author: hephaex@gmail.com

use crate::auth::interceptor::access_middleware;
use crate::handlers::auth;
use crate::state::AppState;
use axum::{middleware, routing::post, Router};
use std::sync::Arc;

/// `POST /AuthService/{Method}` routes, all behind the access interceptor
///
/// Whether a method needs a token is decided by the permission registry,
/// not by how it is mounted here.
pub fn auth_service_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/AuthService/Register", post(auth::register_handler))
        .route(
            "/AuthService/RegisterUserWithOrganization",
            post(auth::register_organization_handler),
        )
        .route("/AuthService/Login", post(auth::login_handler))
        .route("/AuthService/LoginGlobal", post(auth::login_global_handler))
        .route("/AuthService/Logout", post(auth::logout_handler))
        .route("/AuthService/RefreshToken", post(auth::refresh_handler))
        .route("/AuthService/ValidateToken", post(auth::validate_token_handler))
        .route("/AuthService/ForgotPassword", post(auth::forgot_password_handler))
        .route(
            "/AuthService/ForgotPasswordWithOTP",
            post(auth::forgot_password_otp_handler),
        )
        .route(
            "/AuthService/VerifyOTPAndResetPassword",
            post(auth::reset_password_otp_handler),
        )
        .route(
            "/AuthService/ResetPasswordByToken",
            post(auth::reset_password_handler),
        )
        .route(
            "/AuthService/SendVerificationEmail",
            post(auth::send_verification_handler),
        )
        .route("/AuthService/VerifyEmail", post(auth::verify_email_handler))
        .route(
            "/AuthService/SwitchOrganization",
            post(auth::switch_organization_handler),
        )
        .route(
            "/AuthService/InvalidateAllSessions",
            post(auth::invalidate_all_sessions_handler),
        )
        .route(
            "/AuthService/GetActiveSessions",
            post(auth::active_sessions_handler),
        )
        .route("/AuthService/CreateRole", post(auth::create_role_handler))
        .route(
            "/AuthService/GrantRolePermission",
            post(auth::grant_permission_handler),
        )
        .route("/AuthService/AssignRole", post(auth::assign_role_handler))
        .route("/AuthService/DeactivateUser", post(auth::deactivate_user_handler))
        .route(
            "/AuthService/ListPermissions",
            post(auth::list_permissions_handler),
        )
        .route_layer(middleware::from_fn_with_state(state, access_middleware))
}

//! HTTP middleware shared by every route
//!
//! Authorization itself lives in [`crate::auth::interceptor`].
//!
//! Author: hephaex@gmail.com

pub mod metrics;
pub mod security_headers;

pub use metrics::metrics_middleware;
pub use security_headers::security_headers_middleware;

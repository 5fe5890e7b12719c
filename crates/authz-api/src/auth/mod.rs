//! Authentication and authorization
//!
//! - [`store`]: persistence ports and adapters
//! - [`issuer`]: token minting, lookup and revocation
//! - [`service`]: identity operations (login, refresh, recovery, roles)
//! - [`registry`]: operation to permission tables
//! - [`interceptor`]: per-call authorization and the `Caller` extractor
//! - [`org_switch`]: organization-switch decisions

pub mod clock;
pub mod codec;
pub mod interceptor;
pub mod issuer;
pub mod models;
pub mod notifier;
pub mod org_switch;
pub mod password;
pub mod registry;
pub mod service;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use interceptor::{access_middleware, AccessInterceptor, Caller};
pub use issuer::TokenIssuer;
pub use notifier::{LogNotifier, Notifier};
pub use registry::{PermissionRegistry, Requirement};
pub use service::IdentityService;
pub use store::{CredentialStore, DirectoryStore, IdentityStore, MemoryStore, PgStore};

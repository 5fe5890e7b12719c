//! Configuration Management
//!
//! Handles configuration from environment variables and TOML files with
//! defaults suitable for local development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted lifetime or interval, in seconds (ten years)
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Credential store connection
    pub database: DatabaseConfig,

    /// Token lifetimes, hashing cost and access policy
    pub auth: AuthConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    /// Overwrite every field whose environment variable is set
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Server
        env_string("API_HOST", &mut self.server.host);
        env_parse("API_PORT", &mut self.server.port)?;
        env_parse("CORS_ENABLED", &mut self.server.cors_enabled)?;
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Credential store
        if let Ok(backend) = std::env::var("STORAGE_BACKEND") {
            self.database.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.postgres_url = url;
            self.database.backend = StorageBackend::Postgres;
        }
        env_parse("DATABASE_POOL_SIZE", &mut self.database.postgres_pool_size)?;
        env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", &mut self.database.acquire_timeout_secs)?;

        // Auth
        let auth = &mut self.auth;
        env_string("JWT_SECRET", &mut auth.jwt_secret);
        env_string("JWT_ISSUER", &mut auth.jwt_issuer);
        env_parse("SESSION_TTL_SECS", &mut auth.session_ttl_secs)?;
        env_parse("REFRESH_TTL_SECS", &mut auth.refresh_ttl_secs)?;
        env_parse("PASSWORD_RESET_TTL_SECS", &mut auth.password_reset_ttl_secs)?;
        env_parse("OTP_TTL_SECS", &mut auth.otp_ttl_secs)?;
        env_parse("EMAIL_VERIFICATION_TTL_SECS", &mut auth.email_verification_ttl_secs)?;
        env_parse("STORE_TIMEOUT_MS", &mut auth.store_timeout_ms)?;
        env_parse("SWEEP_INTERVAL_SECS", &mut auth.sweep_interval_secs)?;
        env_string("SUPER_ADMIN_ROLE", &mut auth.super_admin_role);
        env_string("AUTH_SERVICE_NAME", &mut auth.service_name);
        if let Ok(path) = std::env::var("PERMISSION_REGISTRY_PATH") {
            auth.registry_path = Some(PathBuf::from(path));
        }
        env_parse("REQUIRE_VERIFIED_EMAIL", &mut auth.require_verified_email)?;
        env_parse(
            "REVOKE_SESSIONS_ON_PASSWORD_RESET",
            &mut auth.revoke_sessions_on_password_reset,
        )?;
        env_parse("REVOKE_PRIOR_RESET_TOKENS", &mut auth.revoke_prior_reset_tokens)?;
        env_parse("HASH_MEMORY_KIB", &mut auth.hash_memory_kib)?;
        env_parse("HASH_ITERATIONS", &mut auth.hash_iterations)?;
        env_parse("HASH_PARALLELISM", &mut auth.hash_parallelism)?;

        // Logging
        env_string("LOG_LEVEL", &mut self.logging.level);
        env_parse("LOG_JSON", &mut self.logging.json_format)?;
        env_parse("LOG_INCLUDE_LOCATION", &mut self.logging.include_location)?;

        Ok(())
    }

    /// Reject configurations that would make tokens unusable or forgeable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingRequired("JWT_SECRET".to_string()));
        }
        for (key, value) in [
            ("session_ttl_secs", self.auth.session_ttl_secs),
            ("refresh_ttl_secs", self.auth.refresh_ttl_secs),
            ("password_reset_ttl_secs", self.auth.password_reset_ttl_secs),
            ("otp_ttl_secs", self.auth.otp_ttl_secs),
            ("email_verification_ttl_secs", self.auth.email_verification_ttl_secs),
            ("sweep_interval_secs", self.auth.sweep_interval_secs),
        ] {
            if value == 0 || value > MAX_TTL_SECS {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        if self.auth.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "store_timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }
        if self.database.backend == StorageBackend::Postgres
            && self.database.postgres_url.is_empty()
        {
            return Err(ConfigError::MissingRequired("DATABASE_URL".to_string()));
        }
        Ok(())
    }
}

fn env_string(key: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(key) {
        *slot = value;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Some(value) = parse_env(key)? {
        *slot = value;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_enabled: true,
            // Empty by default - set via CORS_ORIGINS
            cors_origins: vec![],
        }
    }
}

/// Which credential store adapter to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(ConfigError::InvalidValue {
                key: "STORAGE_BACKEND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,

    /// PostgreSQL connection URL
    pub postgres_url: String,

    /// PostgreSQL connection pool size
    pub postgres_pool_size: u32,

    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            postgres_url: String::new(),
            postgres_pool_size: 10,
            acquire_timeout_secs: 3,
        }
    }
}

/// Authentication and authorization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for session envelopes
    pub jwt_secret: String,

    /// `iss` claim written into and required on session envelopes
    pub jwt_issuer: String,

    pub session_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub password_reset_ttl_secs: u64,
    pub otp_ttl_secs: u64,
    pub email_verification_ttl_secs: u64,

    /// Upper bound for a single credential store round-trip
    pub store_timeout_ms: u64,

    /// How often the server purges expired credential rows
    pub sweep_interval_secs: u64,

    /// Role whose holders bypass permission checks
    pub super_admin_role: String,

    /// Service whose permission table the interceptor enforces
    pub service_name: String,

    /// Optional TOML permission table replacing the built-in one
    pub registry_path: Option<PathBuf>,

    /// Refuse login until the email is verified (super admins exempt)
    pub require_verified_email: bool,

    /// Log the user out everywhere after a token-based password reset
    pub revoke_sessions_on_password_reset: bool,

    /// Drop older reset tokens when a new one is issued
    pub revoke_prior_reset_tokens: bool,

    /// Argon2 memory cost in KiB
    pub hash_memory_kib: u32,

    /// Argon2 passes
    pub hash_iterations: u32,

    /// Argon2 lanes
    pub hash_parallelism: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-key-change-in-production".to_string(),
            jwt_issuer: "authz".to_string(),
            session_ttl_secs: 60 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            password_reset_ttl_secs: 60 * 60,
            otp_ttl_secs: 5 * 60,
            email_verification_ttl_secs: 24 * 60 * 60,
            store_timeout_ms: 2_000,
            sweep_interval_secs: 300,
            super_admin_role: crate::SUPER_ADMIN_ROLE.to_string(),
            service_name: "AuthService".to_string(),
            registry_path: None,
            require_verified_email: false,
            revoke_sessions_on_password_reset: false,
            revoke_prior_reset_tokens: false,
            hash_memory_kib: 65536,
            hash_iterations: 3,
            hash_parallelism: 4,
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn password_reset_ttl(&self) -> Duration {
        Duration::from_secs(self.password_reset_ttl_secs)
    }

    pub fn otp_ttl(&self) -> Duration {
        Duration::from_secs(self.otp_ttl_secs)
    }

    pub fn email_verification_ttl(&self) -> Duration {
        Duration::from_secs(self.email_verification_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.auth.super_admin_role, "SUPER_ADMIN");
        assert!(!config.auth.revoke_sessions_on_password_reset);
        assert!(!config.auth.revoke_prior_reset_tokens);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(
            "postgres".parse::<StorageBackend>().unwrap(),
            StorageBackend::Postgres
        );
        assert_eq!(
            "Memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert!("redis".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [auth]
            session_ttl_secs = 120
            revoke_sessions_on_password_reset = true

            [server]
            port = 9090
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.session_ttl_secs, 120);
        assert!(config.auth.revoke_sessions_on_password_reset);
        assert_eq!(config.auth.otp_ttl_secs, 300);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = AppConfig::default();
        config.auth.session_ttl_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_absurd_ttl() {
        let mut config = AppConfig::default();
        config.auth.refresh_ttl_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "refresh_ttl_secs"
        ));

        let mut config = AppConfig::default();
        config.auth.email_verification_ttl_secs = MAX_TTL_SECS;
        assert!(config.validate().is_ok());

        config.auth.sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        // Only this test reads these variables
        std::env::set_var("OTP_TTL_SECS", "90");
        std::env::set_var("REVOKE_PRIOR_RESET_TOKENS", "true");
        std::env::set_var("HASH_ITERATIONS", "not-a-number");

        let file: AppConfig = toml::from_str("[auth]\notp_ttl_secs = 600\n").unwrap();
        let result = file.clone().with_env_override();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "HASH_ITERATIONS"
        ));

        std::env::remove_var("HASH_ITERATIONS");
        let config = file.with_env_override().unwrap();
        assert_eq!(config.auth.otp_ttl_secs, 90);
        assert!(config.auth.revoke_prior_reset_tokens);
        assert_eq!(config.auth.refresh_ttl_secs, AuthConfig::default().refresh_ttl_secs);

        std::env::remove_var("OTP_TTL_SECS");
        std::env::remove_var("REVOKE_PRIOR_RESET_TOKENS");
    }

    #[test]
    fn test_validate_requires_postgres_url() {
        let mut config = AppConfig::default();
        config.database.backend = StorageBackend::Postgres;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = AppConfig::from_file("/nonexistent/authz.toml");
        assert!(matches!(result, Err(ConfigError::FileReadError { .. })));
    }
}

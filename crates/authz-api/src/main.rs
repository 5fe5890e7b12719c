//! Authz API Server
//!
//! Serves the AuthService RPC surface with the access interceptor in front.
//!
//! Author: hephaex@gmail.com

use authz_api::auth::registry::catalog;
use authz_api::auth::{
    IdentityService, LogNotifier, MemoryStore, PermissionRegistry, PgStore, SystemClock,
};
use authz_api::{create_router, state::AppState};
use authz_core::{AppConfig, LoggingConfig, StorageBackend};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("authz_api={},tower_http=debug", logging.level).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> anyhow::Result<AppConfig> {
    let config = match std::env::var("AUTHZ_CONFIG") {
        Ok(path) => AppConfig::from_file(path)?.with_env_override()?,
        Err(_) => AppConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn load_registry(config: &AppConfig) -> anyhow::Result<PermissionRegistry> {
    let registry = match &config.auth.registry_path {
        Some(path) => PermissionRegistry::load(path)?,
        None => catalog::for_service(&config.auth.service_name)?,
    };
    Ok(registry)
}

async fn build_service(config: &AppConfig) -> anyhow::Result<IdentityService> {
    let notifier = Arc::new(LogNotifier);
    let clock = Arc::new(SystemClock);

    let service = match config.database.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory credential store; data is lost on restart");
            IdentityService::new(Arc::new(MemoryStore::new()), notifier, clock, &config.auth)
        }
        StorageBackend::Postgres => {
            let store = PgStore::connect(&config.database).await?;
            store.migrate().await?;
            tracing::info!("Connected to PostgreSQL credential store");
            IdentityService::new(Arc::new(store), notifier, clock, &config.auth)
        }
    };
    Ok(service)
}

fn spawn_sweeper(service: Arc<IdentityService>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = service.sweep_expired().await {
                tracing::warn!(error = %e, "Credential sweep failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    let registry = Arc::new(load_registry(&config)?);
    let service = Arc::new(build_service(&config).await?);

    let seeded = service.seed_permissions(&registry).await?;
    tracing::info!(
        service = registry.service(),
        permissions = seeded,
        "Permission registry loaded"
    );

    if config.auth.sweep_interval_secs > 0 {
        spawn_sweeper(
            service.clone(),
            Duration::from_secs(config.auth.sweep_interval_secs),
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, service, registry));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Authz API Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);
    tracing::info!("OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

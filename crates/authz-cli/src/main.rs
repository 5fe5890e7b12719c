//! Authz CLI - operator tooling
//!
//! Usage:
//!   authzctl hash-password <password>
//!   authzctl permissions [--service <name> | --file <path>] [--json]
//!   authzctl migrate
//!   authzctl sweep

use authz_api::auth::password::{
    hash_password_with_config, validate_password_strength, PasswordConfig,
};
use authz_api::auth::registry::{catalog, PermissionRegistry};
use authz_api::auth::{IdentityService, LogNotifier, PgStore, SystemClock};
use authz_core::{AppConfig, StorageBackend};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "authzctl")]
#[command(about = "Authentication and RBAC service tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a password the way the server stores it
    HashPassword {
        password: String,
        /// Skip the strength policy
        #[arg(long)]
        no_check: bool,
    },
    /// Print an operation to permission table
    Permissions {
        /// Built-in table to print
        #[arg(long, default_value = "AuthService", conflicts_with = "file")]
        service: String,
        /// TOML table to validate and print instead
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Create the PostgreSQL schema
    Migrate,
    /// Purge expired credentials once
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authz_api=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::HashPassword { password, no_check } => {
            if !no_check {
                validate_password_strength(&password).map_err(anyhow::Error::msg)?;
            }
            let config = AppConfig::from_env()?;
            let hash =
                hash_password_with_config(&password, &PasswordConfig::from_auth_config(&config.auth))?;
            println!("{hash}");
        }
        Commands::Permissions {
            service,
            file,
            json,
        } => {
            let registry = match file {
                Some(path) => PermissionRegistry::load(&path)?,
                None => catalog::for_service(&service)?,
            };
            print_registry(&registry, json)?;
        }
        Commands::Migrate => {
            let store = connect().await?;
            store.migrate().await?;
            println!("Schema is up to date");
        }
        Commands::Sweep => {
            let config = AppConfig::from_env()?;
            let store = connect().await?;
            let service = IdentityService::new(
                Arc::new(store),
                Arc::new(LogNotifier),
                Arc::new(SystemClock),
                &config.auth,
            );
            let purged = service.sweep_expired().await?;
            println!("Purged {purged} expired credentials");
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<PgStore> {
    let config = AppConfig::from_env()?;
    if config.database.backend != StorageBackend::Postgres {
        anyhow::bail!("DATABASE_URL is not set");
    }
    Ok(PgStore::connect(&config.database).await?)
}

fn print_registry(registry: &PermissionRegistry, json: bool) -> anyhow::Result<()> {
    if json {
        let operations: serde_json::Map<String, serde_json::Value> = registry
            .operations()
            .map(|(op, perms)| (op.to_string(), serde_json::json!(perms)))
            .collect();
        let doc = serde_json::json!({
            "service": registry.service(),
            "public": registry.public_operations().collect::<Vec<_>>(),
            "operations": operations,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{}", registry.service());
    for op in registry.public_operations() {
        println!("  {op:<45} public");
    }
    for (op, perms) in registry.operations() {
        let perms: Vec<&str> = perms.iter().map(String::as_str).collect();
        println!("  {op:<45} {}", perms.join(" | "));
    }
    Ok(())
}

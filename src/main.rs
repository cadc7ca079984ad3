//! `coursegate` binary: serve the API and administer identities.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coursegate::auth::{CredentialStore, NewIdentity};
use coursegate::config::Config;
use coursegate::gateway;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Course catalog API with stateless bearer-token authentication.
#[derive(Parser)]
#[command(name = "coursegate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Bind address (overrides [gateway] host)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides [gateway] port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage identities
    #[command(subcommand)]
    User(UserCommands),
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register an identity without going through the API
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Grant staff (admin) rights
        #[arg(long)]
        staff: bool,
    },
    /// Deactivate an identity; its outstanding tokens stop verifying
    Deactivate {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with secrets masked
    Show,
}

fn open_credential_store(config: &Config) -> Result<CredentialStore> {
    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    CredentialStore::new(&db_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coursegate=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await
        }
        Commands::User(UserCommands::Create {
            email,
            phone,
            password,
            first_name,
            last_name,
            staff,
        }) => {
            let store = open_credential_store(&config)?;
            let identity = store.register(&NewIdentity {
                email,
                phone_number: phone,
                password,
                first_name,
                last_name,
                is_staff: staff,
            })?;
            println!("Created identity {} <{}>", identity.id, identity.email);
            Ok(())
        }
        Commands::User(UserCommands::Deactivate { id }) => {
            let store = open_credential_store(&config)?;
            if store.deactivate(id)? {
                println!("Deactivated identity {id}");
                Ok(())
            } else {
                anyhow::bail!("No identity with id {id}")
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_redacted_toml()?);
            Ok(())
        }
    }
}

//! Wager ledger node
//!
//! Serves the HTTP API and runs the maintenance sweeper. The account
//! subcommands bootstrap administrators and sub-agents while the node is down.

use clap::{Parser, Subcommand, ValueEnum};
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use wager_ledger::{api::ApiServer, ledger::Role, ConfigLoader, LedgerConfig, LedgerEngine};

#[derive(Parser)]
#[command(name = "wager-ledger")]
#[command(about = "Ledger and wagering-consistency engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start from the development preset instead of defaults
    #[arg(long)]
    dev: bool,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and sweeper
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write the effective configuration as TOML
    InitConfig {
        #[arg(short, long, default_value = "wager-ledger.toml")]
        output: String,
    },

    /// Create an account
    Register {
        user_id: String,

        #[arg(short, long, value_enum, default_value = "user")]
        role: RoleArg,

        /// Referring sub-agent or user
        #[arg(long)]
        referred_by: Option<String>,
    },

    /// Ban or unban an account
    Ban {
        /// Administrator performing the change
        #[arg(long)]
        admin: String,

        user_id: String,

        #[arg(long)]
        lift: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    SubAgent,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::User => Role::User,
            RoleArg::SubAgent => Role::SubAgent,
            RoleArg::Admin => Role::Admin,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_directory = dir.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_filter.clone().into()),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            config.validate()?;

            info!("Starting wager ledger v{}", env!("CARGO_PKG_VERSION"));
            let engine = Arc::new(LedgerEngine::open(config.clone())?);
            ApiServer::new(config, engine).run().await
        }
        Commands::InitConfig { output } => {
            ConfigLoader::new().save(&config, &output)?;
            println!("Configuration written to {}", output);
            Ok(())
        }
        Commands::Register {
            user_id,
            role,
            referred_by,
        } => {
            let engine = LedgerEngine::open(config)?;
            let account = engine
                .store
                .register_account(&user_id, role.into(), referred_by.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&account)?);
            Ok(())
        }
        Commands::Ban { admin, user_id, lift } => {
            let engine = LedgerEngine::open(config)?;
            let account = engine.store.set_banned(&admin, &user_id, !lift)?;
            println!("{} banned: {}", account.user_id, account.is_banned);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<LedgerConfig, Box<dyn std::error::Error>> {
    if cli.dev && cli.config.is_none() {
        return Ok(LedgerConfig::development());
    }
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    Ok(loader.load()?)
}

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collar_crypto::{HomeDirectory, KeyStore, ScopeResolver};
use tracing::info;

mod commands;
mod config;

use config::KeytoolConfig;

#[derive(Parser)]
#[command(name = "collar-keytool", about = "Inspect and maintain Collar Signal key stores")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Home directory holding per-server stores, overrides config
    #[arg(long)]
    home: Option<PathBuf>,

    /// Server whose store to open, overrides config
    #[arg(short, long)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create identity material and the first prekeys if missing
    Init,
    /// Show identity and prekey status
    Info,
    /// Manage one-time prekeys
    Prekeys {
        #[command(subcommand)]
        action: PrekeyAction,
    },
    /// Print the public prekey bundle as JSON
    Bundle {
        /// One-time prekey to include (default: lowest stored id)
        #[arg(long)]
        pre_key: Option<u32>,
        /// Signed prekey to include (default: newest)
        #[arg(long)]
        signed_pre_key: Option<u32>,
    },
    /// Inspect or drop sessions with a peer
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Pin a peer's identity key (hex) as trusted
    Trust {
        name: String,
        #[arg(long, default_value_t = collar_protocol::DEFAULT_DEVICE_ID)]
        device: u32,
        identity_key: String,
    },
    /// Establish a session from a peer's bundle JSON file
    Establish { name: String, bundle: PathBuf },
}

#[derive(Subcommand)]
enum PrekeyAction {
    /// Generate prekeys after the last generated id
    Generate {
        #[arg(long)]
        count: Option<u32>,
    },
    /// Top up prekeys if below the configured threshold
    Replenish,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List device ids with a session under a name
    List { name: String },
    /// Delete one device's session, or all of them
    Delete {
        name: String,
        #[arg(long)]
        device: Option<u32>,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collar=info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        toml::from_str(&content)?
    } else {
        KeytoolConfig::default()
    };

    // CLI overrides
    if let Some(home) = args.home {
        config.home = home;
    }
    if let Some(server) = args.server {
        config.server = server;
    }

    let home = HomeDirectory::new(&config.home);
    let root = home.resolve(&config.server)?;
    let store = KeyStore::open_scoped(&home, &config.server)
        .with_context(|| format!("failed to open key store at {}", root.display()))?;
    info!(server = %config.server, root = %root.display(), "key store ready");

    let mut out = io::stdout().lock();
    match args.command {
        Command::Init => commands::init(&store, &config, &mut out),
        Command::Info => commands::show_info(&store, &root, &mut out),
        Command::Prekeys { action } => match action {
            PrekeyAction::Generate { count } => {
                commands::generate(&store, count.unwrap_or(config.prekey_batch), &mut out)
            }
            PrekeyAction::Replenish => commands::replenish(&store, &config, &mut out),
        },
        Command::Bundle {
            pre_key,
            signed_pre_key,
        } => commands::bundle(&store, config.device_id, pre_key, signed_pre_key, &mut out),
        Command::Sessions { action } => match action {
            SessionAction::List { name } => commands::list_sessions(&store, &name, &mut out),
            SessionAction::Delete { name, device } => {
                commands::delete_sessions(&store, &name, device, &mut out)
            }
        },
        Command::Trust {
            name,
            device,
            identity_key,
        } => commands::trust(&store, &name, device, &identity_key, &mut out),
        Command::Establish { name, bundle } => {
            let json = fs::read_to_string(&bundle)
                .with_context(|| format!("failed to read bundle file: {}", bundle.display()))?;
            commands::establish(&store, &name, &json, &mut out)
        }
    }
}

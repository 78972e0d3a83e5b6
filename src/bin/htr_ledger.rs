use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use htr_ledger::payload::PublicKeyData;
use htr_ledger::transport::{HidConnector, HidMonitor};
use htr_ledger::{DeviceSession, LedgerConfig, SessionNotification};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "htr-ledger")]
#[command(about = "Talk to the HTR companion app on a Ledger device")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (camelCase keys, every key optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the connect timeout
    #[arg(long, global = true)]
    connect_timeout_ms: Option<u64>,

    /// Override the delay between device removal and locking
    #[arg(long, global = true)]
    lock_grace_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the companion app is open and supported
    Version,
    /// Print the account public key, chain code and parent fingerprint
    Pubkey,
    /// Show the address at an index on the device screen
    CheckAddress { index: u32 },
    /// Forget every token signature stored on the device
    ResetTokens,
    /// Follow attach/remove events and report app open and lock transitions
    Watch,
}

impl Cli {
    fn load_config(&self) -> Result<LedgerConfig> {
        let mut config = match &self.config {
            Some(path) => LedgerConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => LedgerConfig::default(),
        };
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = self.lock_grace_ms {
            config.lock_grace_period_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.load_config()?;
    let session = DeviceSession::new(Arc::new(HidConnector), config);

    match cli.command {
        Commands::Version => {
            let version = session.app_version().await?;
            println!("HTR app {}", version);
        }
        Commands::Pubkey => {
            let response = session.get_public_key_data().await?;
            let data = PublicKeyData::parse(&response)?;
            println!("public key:  {}", hex::encode(data.public_key));
            println!("chain code:  {}", hex::encode(data.chain_code));
            println!("fingerprint: {}", hex::encode(data.fingerprint));
        }
        Commands::CheckAddress { index } => {
            println!("Compare the address on your Ledger, then confirm on the device.");
            session.check_address(index).await?;
            println!("Address {} shown on device", index);
        }
        Commands::ResetTokens => {
            session.reset_token_signatures().await?;
            println!("Token signatures reset");
        }
        Commands::Watch => watch(session).await?,
    }
    Ok(())
}

async fn watch(session: Arc<DeviceSession>) -> Result<()> {
    let (tx, rx) = mpsc::channel(16);
    let _monitor = HidMonitor::start(tx)?;
    let events = session.spawn_event_loop(rx);
    let mut notifications = session.subscribe();

    println!("Watching for Ledger events, Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => match notification {
                Ok(SessionNotification::AppOpened) => println!("HTR app opened"),
                Ok(SessionNotification::DeviceLocked) => println!("Ledger locked"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("missed {} notifications", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    events.abort();
    Ok(())
}

//! `nous-sync` — diagnostic CLI for the Nous sync engine.
//!
//! Exit codes: 0 OK, 1 irrecoverable, 2 schema too old, 3 lock held,
//! 4 integrity failure.

use clap::{Parser, Subcommand};
use nous_sync::config::EngineConfig;
use nous_sync::crypto::codec::content_checksum;
use nous_sync::error::SyncError;
use nous_sync::model::{DeviceRecord, Platform, PrivacyTier};
use nous_sync::store::SyncStore;
use nous_sync::sync::protocol::RelayClient;
use nous_sync::sync::relay::{serve, RelayConfig, RelayCore};
use nous_sync::NousSyncEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXIT_OK: i32 = 0;
const EXIT_IRRECOVERABLE: i32 = 1;
const EXIT_SCHEMA_TOO_OLD: i32 = 2;
const EXIT_LOCK_HELD: i32 = 3;
const EXIT_INTEGRITY: i32 = 4;

#[derive(Parser)]
#[command(
    name = "nous-sync",
    about = "Diagnostics for the Nous knowledge-graph sync engine",
    version
)]
struct Cli {
    /// Path to the engine database.
    #[arg(long, default_value = "nous-sync.db", global = true)]
    db: PathBuf,

    /// Path to the engine config TOML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print sync state counters and key-version lifecycle.
    Status,
    /// Run one push + pull cycle against a relay.
    Sync {
        /// Relay base URL.
        #[arg(long)]
        relay_url: String,
        /// User namespace.
        #[arg(long, default_value = "default")]
        user: String,
        /// Treat the namespace as Private tier.
        #[arg(long)]
        private: bool,
    },
    /// Verify stored checksums against stored plaintext.
    Verify,
    /// Expire old conflicts and compact oversized version vectors.
    Compact,
    /// Run a relay on this machine.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nous_sync=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<SyncError>() {
        Some(SyncError::SchemaTooOld { .. }) => EXIT_SCHEMA_TOO_OLD,
        Some(SyncError::LockHeld { .. }) | Some(SyncError::LockExpired) => EXIT_LOCK_HELD,
        Some(SyncError::IntegrityError { .. }) | Some(SyncError::KeyVersionMissing { .. }) => {
            EXIT_INTEGRITY
        }
        _ => EXIT_IRRECOVERABLE,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Status => status(&cli.db),
        Command::Sync {
            relay_url,
            user,
            private,
        } => sync(&cli.db, config, &relay_url, &user, private).await,
        Command::Verify => verify(&cli.db),
        Command::Compact => compact(&cli.db, config),
        Command::Serve { addr } => {
            let core = Arc::new(RelayCore::new(RelayConfig::default()));
            serve(core, addr.parse()?).await
        }
    }
}

/// Load or mint this machine's device identity, stored next to the
/// database.
fn local_device(db_path: &Path) -> anyhow::Result<DeviceRecord> {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let id_path = dir.join(".device_id");

    let platform = if cfg!(target_os = "macos") {
        Platform::Mac
    } else if cfg!(target_os = "windows") {
        Platform::Win
    } else {
        Platform::Web
    };

    if id_path.exists() {
        let device_id = std::fs::read_to_string(&id_path)?.trim().to_string();
        let mut device = DeviceRecord::generate(platform, "cli");
        device.device_id = device_id;
        Ok(device)
    } else {
        let device = DeviceRecord::generate(platform, "cli");
        std::fs::write(&id_path, &device.device_id)?;
        Ok(device)
    }
}

fn status(db_path: &Path) -> anyhow::Result<()> {
    let store = SyncStore::open(db_path)?;

    println!("pending:    {}", store.count_by_status(nous_sync::SyncStatus::Pending)?);
    println!("synced:     {}", store.count_by_status(nous_sync::SyncStatus::Synced)?);
    println!("conflicts:  {}", store.conflict_count()?);
    println!("queued:     {}", store.queue_len()?);
    println!("drift_ms:   {:.1}", store.drift_ms()?);
    println!(
        "cursor:     {}",
        store.pull_cursor()?.unwrap_or_else(|| "-".into())
    );

    let versions = store.list_key_versions()?;
    if !versions.is_empty() {
        println!("key versions:");
        for record in versions {
            println!("  v{} {}", record.version, record.status.as_str());
        }
    }
    if let Some(rotation) = store.load_rotation()? {
        println!(
            "rotation:   {} (cursor {})",
            rotation.phase.as_str(),
            rotation.last_processed_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn sync(
    db_path: &Path,
    config: EngineConfig,
    relay_url: &str,
    user: &str,
    private: bool,
) -> anyhow::Result<()> {
    let device = local_device(db_path)?;
    let store = Arc::new(SyncStore::open(db_path)?);
    let tier = if private {
        PrivacyTier::Private
    } else {
        PrivacyTier::Standard
    };

    let client = RelayClient::new(
        relay_url,
        &device.device_id,
        user,
        nous_sync::model::SCHEMA_VERSION,
        config.sync.max_retries,
        config.sync.retry_base_delay_ms,
    );
    let engine = NousSyncEngine::new(store, config, device, tier)?;

    let report = engine.sync_cycle(&client).await?;
    println!(
        "pushed {} (conflicts {}), pulled {} (overwritten {}, merged {}, conflicts {}, discarded {})",
        report.pushed,
        report.push_conflicts,
        report.pulled,
        report.overwritten,
        report.merged,
        report.conflicts_recorded,
        report.discarded,
    );
    Ok(())
}

fn verify(db_path: &Path) -> anyhow::Result<()> {
    let store = SyncStore::open(db_path)?;
    let mut checked = 0usize;

    for node_id in store.encrypted_node_ids()? {
        let Some(node) = store.get_node(&node_id)? else {
            continue;
        };
        let (Some(payload), Some(checksum)) = (&node.payload, &node.content_checksum) else {
            continue;
        };
        let bytes = serde_json::to_vec(payload)?;
        if content_checksum(&bytes) != *checksum {
            return Err(SyncError::IntegrityError {
                context: format!("checksum mismatch for node {node_id}"),
            }
            .into());
        }
        checked += 1;
    }

    println!("verified {checked} nodes");
    Ok(())
}

fn compact(db_path: &Path, config: EngineConfig) -> anyhow::Result<()> {
    let device = local_device(db_path)?;
    let store = Arc::new(SyncStore::open(db_path)?);
    let engine = NousSyncEngine::new(store, config, device, PrivacyTier::Standard)?;
    engine.run_maintenance()?;
    println!("maintenance complete");
    Ok(())
}

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use charsync_core::client::SyncClient;
use charsync_core::config::Config;
use charsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use charsync_core::model::{CharacterData, CharacterSnapshot};
use charsync_core::remote::{tcp, MemoryRemote};
use charsync_core::{CycleOutcome, SnapshotSource, SyncResult};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "charsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; created by `register` if missing
    #[arg(short, long, default_value = "~/.config/charsync/charsync.toml")]
    config: String,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print what the service pushes
    Connect,
    /// Publish the character described by a JSON manifest once
    Push {
        /// Path to a `CharacterData` JSON file
        #[arg(long)]
        manifest: PathBuf,
        /// Identity announced to the service before pushing
        #[arg(long, default_value = "charsync-cli")]
        identity: String,
        /// Recipients; defaults to the online peers the service reports
        #[arg(long = "to")]
        recipients: Vec<String>,
    },
    /// Fetch the content a snapshot references into the local cache
    Download {
        /// Path to a `CharacterSnapshot` JSON file
        #[arg(long)]
        snapshot: PathBuf,
    },
    /// List paired peers
    Peers,
    /// Obtain a new secret and save it to the config file
    Register,
    /// Run an in-memory coordination service for local testing
    Serve {
        #[arg(long, default_value = "127.0.0.1:6900")]
        listen: String,
        /// Create a user and print its secret (repeatable)
        #[arg(long = "user")]
        users: Vec<String>,
        /// Pair two users, written as `A,B` (repeatable)
        #[arg(long = "pair")]
        pairs: Vec<String>,
    },
}

/// Reads the local character from a manifest on every build
struct ManifestSource {
    path: PathBuf,
    recipients: Mutex<Vec<String>>,
}

#[async_trait]
impl SnapshotSource for ManifestSource {
    async fn build(&self) -> SyncResult<CharacterData> {
        let contents = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    async fn visible_peers(&self) -> Vec<String> {
        self.recipients.lock().await.clone()
    }
}

/// For commands that never publish
struct NoLocalState;

#[async_trait]
impl SnapshotSource for NoLocalState {
    fn is_ready(&self) -> bool {
        false
    }

    async fn build(&self) -> SyncResult<CharacterData> {
        Ok(CharacterData::new())
    }

    async fn visible_peers(&self) -> Vec<String> {
        Vec::new()
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        Config::from_env()?
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = PathBuf::from(shellexpand::tilde(&args.config).into_owned());
    let mut config = load_config(&config_path)?;

    // Parse log level
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    let log_config = LogConfig::try_from(&config.logging)
        .unwrap_or_else(|e| {
            eprintln!("{}, using 'info'", e);
            LogConfig::new(LogLevel::Info).with_target(config.logging.with_target)
        })
        .json_format(args.json_logs || config.logging.json_format);

    // Initialize logging
    init_logging_with_config(log_config)?;
    charsync_core::metrics::describe_metrics();

    match args.command {
        Command::Connect => connect(&config).await,
        Command::Push {
            manifest,
            identity,
            recipients,
        } => push(&config, manifest, &identity, recipients).await,
        Command::Download { snapshot } => download(&config, &snapshot).await,
        Command::Peers => peers(&config).await,
        Command::Register => register(config, &config_path).await,
        Command::Serve {
            listen,
            users,
            pairs,
        } => serve(&listen, &users, &pairs).await,
    }
}

async fn connect(config: &Config) -> Result<()> {
    let (client, mut events) = SyncClient::connect_tcp(config, Arc::new(NoLocalState))?;
    let mut session_events = client.session().subscribe();
    client.connect().await?;
    info!(uri = %config.server.active_uri(), "Connected, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = session_events.recv() => println!("{:?}", event),
            Some(data) = events.peer_data.recv() => {
                println!(
                    "{} sent snapshot {} ({} assets)",
                    data.sender_id,
                    data.snapshot.fingerprint(),
                    data.snapshot.content_assets().len()
                );
            }
            Some(notification) = events.pairing.recv() => println!("{:?}", notification),
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn push(
    config: &Config,
    manifest: PathBuf,
    identity: &str,
    recipients: Vec<String>,
) -> Result<()> {
    let source = Arc::new(ManifestSource {
        path: manifest,
        recipients: Mutex::new(recipients),
    });
    let (client, _events) = SyncClient::connect_tcp(config, source.clone())?;
    client.connect().await?;

    let online = client.session().announce_identity(identity).await?;
    {
        let mut recipients = source.recipients.lock().await;
        if recipients.is_empty() {
            *recipients = online;
        }
    }

    if !client.notify_changed() {
        bail!("publish cycle could not be started");
    }
    let outcome = client.detector().wait_idle().await;
    client.shutdown().await;

    match outcome {
        Some(CycleOutcome::Sent { fingerprint }) => {
            println!("Published {}", fingerprint);
            Ok(())
        }
        Some(CycleOutcome::Unchanged) => {
            println!("Nothing to publish");
            Ok(())
        }
        Some(CycleOutcome::Abandoned(reason)) | Some(CycleOutcome::Failed(reason)) => {
            bail!("publish failed: {}", reason)
        }
        None => bail!("publish cycle was interrupted"),
    }
}

async fn download(config: &Config, snapshot_path: &Path) -> Result<()> {
    let contents = tokio::fs::read(snapshot_path)
        .await
        .with_context(|| format!("Failed to read {}", snapshot_path.display()))?;
    let snapshot: CharacterSnapshot = serde_json::from_slice(&contents)?;
    if !snapshot.is_consistent() {
        warn!("Snapshot fingerprint does not match its content");
    }

    let (client, _events) = SyncClient::connect_tcp(config, Arc::new(NoLocalState))?;
    client.connect().await?;
    let report = client.download_for(&snapshot).await;
    client.shutdown().await;
    let report = report?;

    for (hash, path) in &report.stored {
        println!("stored  {} -> {}", hash, path.display());
    }
    for hash in &report.skipped {
        println!("skipped {}", hash);
    }
    for (hash, err) in &report.failed {
        println!("failed  {}: {}", hash, err);
    }
    if !report.failed.is_empty() {
        bail!("{} downloads failed", report.failed.len());
    }
    Ok(())
}

async fn peers(config: &Config) -> Result<()> {
    let (client, _events) = SyncClient::connect_tcp(config, Arc::new(NoLocalState))?;
    client.connect().await?;
    let peers = client.session().request_peer_list().await;
    client.shutdown().await;

    for peer in peers? {
        println!(
            "{}  synced={} paused={} paused_by_peer={}",
            peer.peer_id, peer.is_synced, peer.is_paused, peer.is_paused_by_peer
        );
    }
    Ok(())
}

async fn register(mut config: Config, config_path: &Path) -> Result<()> {
    let (client, _events) = SyncClient::connect_tcp(&config, Arc::new(NoLocalState))?;
    let secret = client.session().register().await;
    client.shutdown().await;
    let secret = secret?;

    config.server.set_secret(secret);
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save_to_file(config_path)?;
    println!("Registered; secret saved to {}", config_path.display());
    Ok(())
}

async fn serve(listen: &str, users: &[String], pairs: &[String]) -> Result<()> {
    let remote = MemoryRemote::new();
    for user in users {
        let secret = remote.add_user(user.as_str());
        println!("{} {}", user, secret);
    }
    for pair in pairs {
        let Some((a, b)) = pair.split_once(',') else {
            bail!("pair must be written as A,B: {}", pair);
        };
        remote.pair(a.trim(), b.trim());
    }

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(listen = %listen, "Serving in-memory sync service");

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(tcp::serve(listener, remote, shutdown.clone()));
    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    server.await??;
    Ok(())
}

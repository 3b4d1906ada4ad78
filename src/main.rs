use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use forklift_link::config::AppConfig;
use forklift_link::{ConnectionManager, ConnectionState, ForkliftClient, ManagerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Forklift fleet MQTT link: monitor a unit or send it commands.
#[derive(Parser)]
#[command(name = "forklift-link")]
#[command(version)]
struct Cli {
    /// Path to configuration file (default: ~/.config/forklift-link/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print state, pose, ack and progress updates until Ctrl-C
    Monitor(MonitorArgs),

    /// Send one move command and wait for the broker to take it
    Move(MoveArgs),

    /// Write a default configuration file
    InitConfig(InitConfigArgs),
}

#[derive(Args)]
struct MonitorArgs {
    /// Telemetry source instance (default: the configured instance)
    #[arg(long)]
    source: Option<String>,
}

#[derive(Args)]
struct MoveArgs {
    /// Pallet or load to move
    #[arg(long)]
    target: String,

    /// Where to move it
    #[arg(long)]
    destination: String,

    /// Seconds to wait for the connection and the acknowledgement
    #[arg(long, default_value_t = 15)]
    timeout: u64,
}

#[derive(Args)]
struct InitConfigArgs {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Commands::Monitor(args) => monitor(&path, args).await,
        Commands::Move(args) => send_move(&path, args).await,
        Commands::InitConfig(args) => init_config(&path, args.force).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn start_manager(
    path: &Path,
    events: mpsc::Sender<ManagerEvent>,
) -> Result<Arc<ConnectionManager>> {
    let config = AppConfig::load(path)
        .await
        .map_err(|e| eyre!("Failed to load config: {}", e))?;

    let material = match config.tls.load().await {
        Some(loaded) => Some(loaded.map_err(|e| eyre!("Failed to load TLS material: {}", e))?),
        None => None,
    };

    info!(
        "Starting {} against {}",
        config.naming.client_id(),
        config.broker.address
    );
    let manager = ConnectionManager::with_tls_material(
        &config.naming,
        config.manager_settings(),
        material.as_ref(),
        Some(events),
    )
    .await
    .map_err(|e| eyre!("Failed to create connection manager: {}", e))?;

    Ok(Arc::new(manager))
}

async fn monitor(path: &Path, args: MonitorArgs) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel(1000);
    let manager = start_manager(path, events_tx.clone()).await?;
    let client = ForkliftClient::new(manager.clone());

    client
        .attach(events_tx, args.source.as_deref())
        .map_err(|e| eyre!("Failed to register subscriptions: {}", e))?;
    manager
        .connect()
        .map_err(|e| eyre!("Failed to start connecting: {}", e))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            }
        }
    }

    manager.close().await;
    Ok(())
}

async fn send_move(path: &Path, args: MoveArgs) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel(100);
    let manager = start_manager(path, events_tx).await?;
    let client = ForkliftClient::new(manager.clone());

    let drain = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            debug!("{:?}", event);
        }
    });

    let timeout = Duration::from_secs(args.timeout);
    manager
        .connect()
        .map_err(|e| eyre!("Failed to start connecting: {}", e))?;

    let result = async {
        tokio::time::timeout(timeout, manager.wait_for_state(ConnectionState::Connected))
            .await
            .map_err(|_| eyre!("Not connected after {}s", args.timeout))?
            .map_err(|e| eyre!("Connection manager stopped: {}", e))?;

        let handle = client
            .send_move(&args.target, &args.destination)
            .map_err(|e| eyre!("Failed to send move command: {}", e))?;

        match tokio::time::timeout(timeout, handle).await {
            Ok(true) => {
                println!(
                    "move_to {} -> {} accepted by broker",
                    args.target.trim(),
                    args.destination.trim()
                );
                Ok(())
            }
            Ok(false) => Err(eyre!("Broker did not accept the move command")),
            Err(_) => Err(eyre!("No acknowledgement after {}s", args.timeout)),
        }
    }
    .await;

    manager.disconnect().await.ok();
    manager.close().await;
    drain.abort();
    result
}

async fn init_config(path: &Path, force: bool) -> Result<()> {
    if force {
        AppConfig::default()
            .save(path)
            .await
            .map_err(|e| eyre!("Failed to write config: {}", e))?;
    } else if !AppConfig::ensure_default(path)
        .await
        .map_err(|e| eyre!("Failed to write config: {}", e))?
    {
        warn!("{} already exists, use --force to overwrite", path.display());
        return Ok(());
    }
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::StateChanged(state) => println!("[state] {}", state),
        ManagerEvent::ConnectFailed { reason } => println!("[error] connect failed: {}", reason),
        ManagerEvent::Retrying { attempt, delay } => {
            println!("[retry] attempt {} in {:.1}s", attempt, delay.as_secs_f64())
        }
        ManagerEvent::SubscribeFailed { filter, reason } => {
            println!("[error] subscribe {} failed: {}", filter, reason)
        }
        ManagerEvent::Pose(pose) => println!("[pose] x={:.3} y={:.3}", pose.x, pose.y),
        ManagerEvent::Ack(ack) => println!("[ack] {}", ack),
        ManagerEvent::Progress(progress) => match &progress.detail {
            Some(detail) => println!("[progress] {} ({})", progress.stage, detail),
            None => println!("[progress] {}", progress.stage),
        },
    }
}

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

use sitesync_rs::config::{Config, ConfigOverrides};
use sitesync_rs::engine::Engine;
use sitesync_rs::events::SyncEvent;
use sitesync_rs::logging;

#[derive(Parser, Debug)]
#[command(name = "sitesync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// API key override (takes precedence over env/config)
    #[arg(long = "api-key")]
    api_key: Option<String>,

    /// Username override (takes precedence over env/config)
    #[arg(long = "username")]
    username: Option<String>,

    /// Sync folder override (takes precedence over env/config)
    #[arg(long = "sync-folder")]
    sync_folder: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync engine until signaled
    Daemon,

    /// Reconcile once against the server and exit
    Sync,

    /// Print the resolved config file path and exit
    ConfigPath,

    /// Print version information
    Version,
}

fn overrides_from(cli: &Cli) -> ConfigOverrides {
    ConfigOverrides {
        api_key: cli.api_key.clone(),
        username: cli.username.clone(),
        sync_folder: cli.sync_folder.clone(),
        server_url: cli.server.clone(),
        config_path: cli.config.clone(),
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncStart => println!("sync: started"),
        SyncEvent::SyncComplete { stats } => println!("sync: complete {stats:?}"),
        SyncEvent::SyncStats { stats } => println!("sync: stats {stats:?}"),
        SyncEvent::SyncError { file, message } => {
            println!("sync: error{} {message}", file.as_deref().map(|f| format!(" [{f}]")).unwrap_or_default())
        }
        SyncEvent::SyncWarning { file, message } => {
            println!("sync: warning{} {message}", file.as_deref().map(|f| format!(" [{f}]")).unwrap_or_default())
        }
        SyncEvent::SyncRetry { file, attempt } => println!("sync: retry {file} (attempt {attempt})"),
        SyncEvent::SyncFailed { file, message } => println!("sync: failed {file}: {message}"),
        SyncEvent::FileSynced { file, action } => println!("sync: {action:?} {file}"),
        SyncEvent::BackupCreated { file, backup_path } => {
            println!("sync: backed up {file} -> {backup_path}")
        }
        SyncEvent::SyncConflict { file, message, suggestions } => {
            println!("sync: conflict {file}: {message} (try: {})", suggestions.join(", "))
        }
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let engine = Engine::new(&config)?;
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let shutdown = std::sync::Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_one();
    });

    engine.run(shutdown).await
}

async fn run_sync(config: Config) -> Result<()> {
    let engine = Engine::new(&config)?;
    let mut events = engine.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });
    let stats = engine.reconcile_once().await?;
    println!("sync: {stats:?}");
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ConfigPath) => {
            let path = sitesync_rs::config::resolved_config_path(cli.config.as_deref())?;
            println!("{}", path.display());
            return Ok(());
        }
        Some(Commands::Version) => {
            println!("sitesync {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let log_path = logging::init_default_log_file()?;
    logging::info(format!("logging to {}", log_path.display()));

    let config = Config::load_with_overrides(overrides_from(&cli))?;

    match cli.command {
        Some(Commands::Daemon) | None => run_daemon(config).await,
        Some(Commands::Sync) => run_sync(config).await,
        Some(Commands::ConfigPath) | Some(Commands::Version) => unreachable!(),
    }
}

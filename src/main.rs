use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};

use proxyd::config::ProxyConfig;
use proxyd::ns::{entry_type, NsEntry, NsRegistry};
use proxyd::server::ProxyServer;
use proxyd::transport::ws::WsTransport;
use proxyd::transport::Transport;
use proxyd::Scheduler;

#[derive(Parser)]
#[command(
    name = "proxyd",
    about = "Reverse socket proxy daemon — serves host sockets to remote clients over a cloud bus",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bus connection string for the control listener
    #[arg(long, env = "PROXYD_CS")]
    connection_string: Option<String>,

    /// Data directory for config and the name-service registry
    #[arg(long, env = "PROXYD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PROXYD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "PROXYD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Restricted destination ports, e.g. "80-80;443-443"
    #[arg(long, env = "PROXYD_RESTRICTED_PORTS")]
    restricted_ports: Option<String>,

    /// Name to register this proxy under when creating a new entry
    #[arg(long, default_value = "proxyd")]
    name: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server in the foreground (default when no subcommand
    /// is given).
    Serve,
    /// Manage the name-service registry.
    Ns {
        #[command(subcommand)]
        action: NsAction,
    },
}

#[derive(Subcommand)]
enum NsAction {
    /// List registry entries.
    List,
    /// Add a proxy entry.
    Add {
        name: String,
        connection_string: String,
    },
    /// Remove an entry by id.
    Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_owned());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let config = ProxyConfig::new(
        args.data_dir,
        args.log,
        args.connection_string,
        args.restricted_ports,
    );

    match args.command {
        Some(Command::Ns { action }) => run_ns(action, &config),
        None | Some(Command::Serve) => run_server(&config, &args.name).await,
    }
}

async fn run_server(config: &ProxyConfig, name: &str) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;
    let registry = open_registry(config)?;

    // Listener identity: a registered proxy entry, or one minted from the
    // configured connection string.
    let entry = match registry.by_type(entry_type::PROXY).into_iter().next() {
        Some(entry) => entry,
        None => {
            let cs_text = config
                .connection_string
                .as_deref()
                .context("no proxy entry registered and no connection string configured")?;
            let cs = cs_text
                .parse()
                .map_err(|e| anyhow::anyhow!("bad connection string: {e}"))?;
            let entry = NsEntry::new_proxy(name, &cs);
            if let Err(e) = registry.add(entry.clone()) {
                warn!(err = %e, "could not persist proxy entry");
            }
            entry
        }
    };
    info!(name = %entry.name, addr = %entry.addr(), "starting proxy server");

    let scheduler = Scheduler::new();
    let transport: Arc<dyn Transport> = WsTransport::new();
    let server = ProxyServer::create(
        transport.clone(),
        Some(transport.clone()),
        &entry,
        &scheduler,
        config.restricted_ports.clone(),
        config.browse_fs,
    )
    .map_err(|e| anyhow::anyhow!("failed to create server: {e}"))?;

    shutdown_signal().await;
    info!("shutdown signal received — draining sockets");
    server.shutdown();
    server.join().await;
    info!("proxy server stopped");
    Ok(())
}

fn run_ns(action: NsAction, config: &ProxyConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir).ok();
    let registry = open_registry(config)?;
    match action {
        NsAction::List => {
            for entry in registry.by_type(u32::MAX) {
                println!(
                    "{}  {:<20} type={:#x} addr={}",
                    entry.id,
                    entry.name,
                    entry.entry_type,
                    entry.addr()
                );
            }
        }
        NsAction::Add {
            name,
            connection_string,
        } => {
            let cs = connection_string
                .parse()
                .map_err(|e| anyhow::anyhow!("bad connection string: {e}"))?;
            let entry = NsEntry::new_proxy(&name, &cs);
            let id = entry.id.clone();
            registry
                .add(entry)
                .map_err(|e| anyhow::anyhow!("add failed: {e}"))?;
            println!("added {id}");
        }
        NsAction::Remove { id } => {
            registry
                .remove(&id)
                .map_err(|e| anyhow::anyhow!("remove failed: {e}"))?;
            println!("removed {id}");
        }
    }
    Ok(())
}

fn open_registry(config: &ProxyConfig) -> Result<Arc<NsRegistry>> {
    let path = config
        .ns_registry
        .clone()
        .unwrap_or_else(|| config.data_dir.join("ns.json"));
    let registry =
        NsRegistry::open(&path).map_err(|e| anyhow::anyhow!("cannot open registry: {e}"))?;
    Ok(Arc::new(registry))
}

/// Resolves when a shutdown signal is received: SIGTERM on Unix, Ctrl-C
/// everywhere.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("proxyd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

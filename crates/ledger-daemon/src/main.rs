//! ledger-daemon: tracks which workstation has which shared project open.
//!
//! Run one `server` per studio and one `client` per edit workstation. Both
//! find each other over mDNS; clients report their open projects to every
//! server they can reach.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ledger_core::{ProjectResolver, Roster};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ledger_daemon::client::{self, ClientRole, ClientSources};
use ledger_daemon::config::{Config, Role};
use ledger_daemon::discovery::Membership;
use ledger_daemon::health::Broadcaster;
use ledger_daemon::transport::HttpTransport;
use ledger_daemon::{idle, server, BundleResolver, FileWatcher, LsofProjects};

#[derive(Parser, Debug)]
#[command(name = "ledger-daemon")]
#[command(about = "LAN project checkout tracker")]
struct Args {
    /// Role to run
    #[arg(value_enum, env = "LEDGER_MODE")]
    mode: Role,

    /// Port to listen on (default: 14036 for server, 12140 for client)
    #[arg(short, long, env = "LEDGER_PORT")]
    port: Option<u16>,

    /// Name advertised to peers (default: this machine's hostname)
    #[arg(long, env = "LEDGER_HOSTNAME")]
    hostname: Option<String>,

    /// Path to a JSON config file
    #[arg(short, long, env = "LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to watch for project activity (repeatable, client only)
    #[arg(short, long = "watch", env = "LEDGER_WATCH", value_delimiter = ',')]
    watch: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(long, env = "LEDGER_VERBOSE")]
    verbose: bool,
}

/// OS hostname without a trailing `.local`.
fn local_hostname() -> Result<String> {
    let raw = hostname::get().context("Failed to read hostname")?;
    let name = raw.to_string_lossy();
    Ok(name.strip_suffix(".local").unwrap_or(&name).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,ledger_daemon=debug"
    } else {
        "info,ledger_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(args.config.as_deref())?;
    if !args.watch.is_empty() {
        config.watch_paths = args.watch.clone();
    }

    let hostname = match args.hostname {
        Some(name) => name,
        None => local_hostname()?,
    };
    let port = args.port.unwrap_or(args.mode.default_port());
    info!("Starting ledger-daemon {} as {} on port {}", args.mode.as_str(), hostname, port);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_cancel.cancel();
    });

    let timings = config.timings.clone();
    let transport = HttpTransport::new(timings.request_timeout())?;
    let roster = Arc::new(Mutex::new(Roster::new(timings.grace_period())));
    let broadcaster = Broadcaster::new(roster.clone(), transport.clone());

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    // Fallible setup runs before advertising
    let client_sources = match args.mode {
        Role::Server => None,
        Role::Client => {
            let resolver: Arc<dyn ProjectResolver> = Arc::new(BundleResolver::from_config(&config));
            let watcher = FileWatcher::new(&config.watch_paths, resolver.clone(), timings.debounce())
                .context("Failed to start file watcher")?;
            info!("Watching {:?}", watcher.roots());

            Some(ClientSources {
                projects: Arc::new(LsofProjects::new(config.editor_process.clone(), resolver)),
                activity: Box::new(watcher),
                idle: idle::platform_probe(),
            })
        }
    };

    let (membership, roster_rx) = Membership::new(roster, transport, cancel.child_token())
        .context("Failed to start mDNS")?;
    let result = match membership
        .start(args.mode.service_type(), args.mode.peer_service_type(), &hostname, port)
        .context("Failed to advertise service")
    {
        Err(e) => Err(e),
        Ok(()) => match client_sources {
            None => {
                server::run(&hostname, listener, broadcaster, timings.liveness_interval(), cancel.clone())
                    .await
            }
            Some(sources) => {
                let role = ClientRole::new(hostname.clone(), port, broadcaster, sources.idle.clone());
                client::run(role, listener, sources, roster_rx, &timings, cancel.clone()).await
            }
        },
    };

    cancel.cancel();
    membership.shutdown().await;
    info!("Shutting down");
    result
}

use std::io;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::procs::SOCKET_ENV;
use warden::worker::{self, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "warden-worker")]
#[command(about = "Per-user file worker spawned by the warden daemon")]
#[command(version)]
struct Cli {
    /// User this worker serves
    #[arg(long)]
    user: String,

    /// Unix socket to listen on
    #[arg(long, env = SOCKET_ENV)]
    socket: PathBuf,

    /// Root directory to serve files from
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout is the control channel to the daemon; logs go to stderr.
    let filter = if cli.verbose {
        "warden=debug,tower_http=debug"
    } else {
        "warden=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let root = cli.root.canonicalize().map_err(|e| {
        error!("Root directory {} unusable: {}", cli.root.display(), e);
        e
    })?;

    let listener = worker::bind(&cli.socket)?;
    info!(
        "Serving {} for {} on {}",
        root.display(),
        cli.user,
        cli.socket.display()
    );
    worker::announce_ready(&mut io::stdout().lock())?;

    let state = WorkerState {
        root,
        user: cli.user,
    };
    worker::serve(listener, &cli.socket, state, shutdown_signal()).await?;

    info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

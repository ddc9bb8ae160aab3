// server: Replica binary for the mirroring group.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Arg, Command};
use rm_protocol::Address;
use server::ServerConfig;
use tokio::sync::watch;
use tracing::info;

fn validate_address(value: &str) -> Result<Address, String> {
    Address::from_str(value)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "server starting");

    let matches = Command::new("rusty-mirror server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A replica of the file mirroring group")
        .arg(
            Arg::new("address")
                .long("address")
                .help("Own address (host:port); doubles as this replica's identity")
                .value_name("host:port")
                .value_parser(validate_address)
                .required(true),
        )
        .arg(
            Arg::new("storage-dir")
                .long("storage-dir")
                .help("Folder that stores the mirrored files")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("join")
                .long("join")
                .help("Join the existing server group at this address (host:port)")
                .value_name("host:port")
                .value_parser(validate_address),
        )
        .arg(
            Arg::new("users")
                .long("users")
                .help("TOML credential file replacing the built-in user directory")
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let mut cfg = ServerConfig::new(
        matches.get_one::<Address>("address").unwrap().clone(),
        matches.get_one::<PathBuf>("storage-dir").unwrap().clone(),
    );
    cfg.join = matches.get_one::<Address>("join").cloned();
    cfg.users_file = matches.get_one::<PathBuf>("users").cloned();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = server::run(cfg, shutdown_rx).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

// client: Watcher binary for the mirroring group.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Arg, ArgAction, Command};
use client::ClientConfig;
use rm_protocol::Address;
use tokio::sync::watch;
use tracing::info;

fn validate_address(value: &str) -> Result<Address, String> {
    Address::from_str(value)
}

fn validate_watch_dir(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if !path.is_dir() {
        return Err(format!("{value:?} is not a directory"));
    }
    Ok(path)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "client starting");

    let matches = Command::new("rusty-mirror client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watches directories and mirrors every change onto the server group")
        .arg(
            Arg::new("server")
                .long("server")
                .help("Server address to connect to (host:port)")
                .value_name("host:port")
                .value_parser(validate_address)
                .required(true),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .help("Authenticate using this user")
                .value_name("name"),
        )
        .arg(
            Arg::new("passwd")
                .long("passwd")
                .help("Authenticate using this password")
                .value_name("secret"),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .help("Directories to watch and mirror")
                .value_name("dir")
                .value_parser(validate_watch_dir)
                .action(ArgAction::Append)
                .num_args(1..),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .help("Local address to bind (host:port); must be routable from the servers")
                .value_name("host:port")
                .value_parser(validate_address),
        )
        .get_matches();

    let mut cfg = ClientConfig::new(matches.get_one::<Address>("server").unwrap().clone());
    if let Some(user) = matches.get_one::<String>("user") {
        cfg.username = user.clone();
    }
    if let Some(passwd) = matches.get_one::<String>("passwd") {
        cfg.password = passwd.clone();
    }
    if let Some(bind) = matches.get_one::<Address>("bind") {
        cfg.bind = bind.clone();
    }
    cfg.watch_dirs = matches
        .get_many::<PathBuf>("watch")
        .map(|dirs| dirs.cloned().collect())
        .unwrap_or_default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = client::run(cfg, shutdown_rx).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
    info!("client shut down gracefully");
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

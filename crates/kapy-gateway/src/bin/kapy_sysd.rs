//! Privileged daemon binary: Unix-socket RPC executing system actions
//! after peer-credential and grant checks.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kapy-sysd", about = "Privileged action daemon for the kapy gateway")]
struct Args {
    /// Path to kapy.toml (defaults to ./kapy.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kapy_sysd=info,kapy_privileged=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match kapy_core::config::KapyConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if config.system.socket_path.is_empty() {
        error!("system.socket_path is required for the daemon");
        std::process::exit(1);
    }

    let grants = if config.system.grant.secret.is_empty() {
        info!("no grant secret configured; grant-requiring ops will be rejected");
        None
    } else {
        match kapy_privileged::SystemGrantManager::new(
            &config.system.grant.secret,
            config.system.grant.ttl_seconds,
        ) {
            Ok(grants) => Some(Arc::new(grants)),
            Err(e) => {
                error!(error = %e, "invalid grant configuration");
                std::process::exit(1);
            }
        }
    };

    let executor = Arc::new(kapy_privileged::SystemExecutor::new(
        config.system.executor.clone(),
        &config.runtime.mode,
    ));
    let server = Arc::new(kapy_privileged::SystemServiceServer::new(
        config.system.socket_path.clone(),
        config.system.daemon.clone(),
        executor,
        grants,
    ));

    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(Arc::clone(&server).run());

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::process::exit(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    shutdown.cancel();
    match handle.await {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(e)) => {
            error!(error = %e, "daemon exited with error");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "daemon task panicked");
            std::process::exit(1);
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kapy_gateway::console::{ConsoleChannel, CONSOLE_CHANNEL, CONSOLE_CHAT, CONSOLE_USER};
use kapy_gateway::Router;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kapy-gateway", about = "Multi-channel gateway for local agent CLIs")]
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
                .unwrap_or_else(|_| "kapy_gateway=info,kapy_agent=info,kapy_privileged=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match kapy_core::config::KapyConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    config.runtime.version = Some(kapy_core::runtime::resolve_version(std::path::Path::new(
        ".runtime-version",
    )));
    if config.agents.is_empty() {
        error!("no agents configured; add at least one [agents.<name>] section");
        std::process::exit(1);
    }

    info!(
        mode = %config.runtime.mode,
        instance = %config.runtime.instance_id,
        version = config.runtime.version.as_deref().unwrap_or("unknown"),
        agents = config.agents.len(),
        "starting kapy gateway"
    );

    let auth = Arc::new(kapy_auth::AuthManager::new(
        &config.auth.state_file,
        config.auth.rate_limit_per_minute,
    ));
    // The local console operator is always allowed.
    auth.add_user(CONSOLE_USER, CONSOLE_CHANNEL);

    let sessions = Arc::new(kapy_sessions::SessionStore::new(
        &config.sessions.state_file,
        config.sessions.max_sessions_per_user,
    ));

    let billing = if config.billing.enabled {
        Some(Arc::new(kapy_billing::BillingLog::new(&config.billing.dir)))
    } else {
        None
    };

    let memory = if config.memory.enabled {
        match kapy_memory::MemoryStore::new(config.memory.clone()) {
            Ok(store) => {
                let store = Arc::new(store);
                Arc::clone(&store).start();
                Some(store)
            }
            Err(e) => {
                // Persistence failures are never fatal; run without memory.
                warn!(error = %e, "memory store unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let two_factor = if config.two_factor.enabled {
        Some(Arc::new(kapy_privileged::TwoFactorManager::new(
            &config.two_factor,
        )))
    } else {
        None
    };

    let system_client = if config.system.socket_path.is_empty() {
        None
    } else {
        Some(Arc::new(kapy_privileged::SystemServiceClient::new(
            &config.system.socket_path,
            config.system.client_timeout_seconds,
        )))
    };

    let grants = if config.system.grant.secret.is_empty() {
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

    let agents = kapy_agent::registry::build_agents(&config, system_client.clone());
    let channel: Arc<dyn kapy_channels::Channel> = Arc::new(ConsoleChannel);

    let router = Arc::new(Router::new(
        config,
        auth,
        sessions,
        agents,
        channel,
        billing,
        memory.clone(),
        two_factor,
        system_client,
        grants,
    ));

    // Hourly stale-session reconciliation.
    {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                router.cleanup_inactive_sessions();
            }
        });
    }

    // Console input loop: one line, one message.
    let input_router = Arc::clone(&router);
    let input = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let mut message = kapy_channels::IncomingMessage::text_message(
                CONSOLE_CHANNEL,
                CONSOLE_CHAT,
                CONSOLE_USER,
                text,
            );
            message.sender_username = Some(CONSOLE_USER.to_string());
            input_router.handle_message(message).await;
        }
    });

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

    input.abort();
    if let Some(memory) = memory {
        memory.stop();
    }
    info!("gateway stopped");
    std::process::exit(0);
}

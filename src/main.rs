use std::net::SocketAddr;

use clap::Parser;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camproxy::config::{AppConfig, CliArgs};
use camproxy::state::AppState;
use camproxy::utils::bind_tcp_listener;
use camproxy::web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config: AppConfig = args.into();

    init_logging(&config.log_level);

    tracing::info!("Starting camera proxy v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(?config.source_mode, "ingest source mode");

    let state = AppState::new(config.clone())?;
    let app = web::create_router(state.clone());

    let listeners = bind_listeners(&config)?;

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        tracing::info!("shutdown signal received");
    };

    let mut servers = FuturesUnordered::new();
    for listener in listeners {
        let local_addr = listener.local_addr()?;
        tracing::info!("listening on http://{}", local_addr);
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let server = axum::serve(listener, app.clone());
        servers.push(async move { server.await });
    }

    tokio::select! {
        _ = shutdown_signal => {}
        result = servers.next() => {
            if let Some(Err(err)) = result {
                tracing::error!(error = %err, "server task exited with an error");
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = format!("camproxy={level},tower_http={level}");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}

fn bind_listeners(config: &AppConfig) -> anyhow::Result<Vec<std::net::TcpListener>> {
    let mut listeners = Vec::new();
    for ip in &config.bind_addresses {
        let addr = SocketAddr::new(*ip, config.http_port);
        match bind_tcp_listener(addr) {
            Ok(listener) => listeners.push(listener),
            Err(err) => tracing::warn!(%addr, error = %err, "failed to bind address"),
        }
    }

    if listeners.is_empty() {
        anyhow::bail!("failed to bind any address on port {}", config.http_port);
    }

    Ok(listeners)
}

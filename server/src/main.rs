use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use bifrost_server::registry::TunnelMapping;
use bifrost_server::state::AppState;
use bifrost_server::{backend, session};

/// Default port of the agent-facing control listener.
const DEFAULT_BACKEND_PORT: u16 = 9041;

/// Seeds the API-key index from `BACKENDS`, a comma-separated list of
/// `backendId:apiKey` pairs. Normally the admin plane installs these at
/// runtime; the env seed exists for standalone deployments.
fn seed_backends(state: &AppState, raw: &str) {
    for entry in raw.split(',') {
        match entry.trim().split_once(':') {
            Some((backend_id, api_key)) if !backend_id.is_empty() && !api_key.is_empty() => {
                state.registry.add_backend(backend_id, api_key);
                info!("Registered backend {}", backend_id);
            }
            _ => warn!("Skipping malformed BACKENDS entry: {:?}", entry),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bifrost_server=info".into()),
        )
        .init();

    let backend_port = match env::var("BACKEND_PORT") {
        Ok(value) => value.parse().context("Invalid BACKEND_PORT")?,
        Err(_) => DEFAULT_BACKEND_PORT,
    };

    let state = AppState::new();

    if let Ok(raw) = env::var("BACKENDS") {
        seed_backends(&state, &raw);
    }
    if let Ok(raw) = env::var("TUNNELS") {
        for mapping in TunnelMapping::parse_from_env(&raw) {
            let key = mapping.key();
            if let Err(e) = state.registry.create_tunnel(&state, mapping) {
                error!("Failed to create tunnel {}:{}: {}", key.0, key.1, e);
            }
        }
    }

    tokio::spawn(session::run_idle_sweeper(state.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], backend_port));
    let control = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control listener on {}", addr))?;
    info!("Control listener on {}", addr);

    loop {
        match control.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    backend::handle_control_conn(state, stream, peer).await;
                });
            }
            Err(e) => {
                error!("Control accept error: {}", e);
            }
        }
    }
}

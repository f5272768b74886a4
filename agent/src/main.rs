//! # Bifrost Agent
//!
//! Runs behind NAT, holds one outbound control connection to the tunnel
//! server, and dials local targets on demand to proxy end-user streams.

use std::env;
use std::sync::Arc;

use anyhow::Context;

mod codec;
mod control;
mod dialer;
mod protocol;
mod state;

use control::AgentConfig;
use state::AgentState;

/// Default control port of the tunnel server.
const DEFAULT_SERVER_PORT: u16 = 9041;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bifrost_agent=info".into()),
        )
        .init();

    let api_key = env::var("API_KEY").context("API_KEY must be set")?;
    let server_host = env::var("SERVER_HOST").context("SERVER_HOST must be set")?;
    let server_port = match env::var("SERVER_PORT") {
        Ok(value) => value.parse().context("Invalid SERVER_PORT")?,
        Err(_) => DEFAULT_SERVER_PORT,
    };

    let state = Arc::new(AgentState::new());
    control::run(
        AgentConfig {
            api_key,
            server_host,
            server_port,
        },
        state,
    )
    .await?;

    Ok(())
}

//! # Agent Control Loop
//!
//! Maintains the persistent control connection to the tunnel server:
//! - Connection establishment and auto-reconnect on failure
//! - Registration with the API key on every connect
//! - Incoming frame dispatch to the dialer
//! - Clean teardown of all local target connections on disconnect

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::codec::FrameTransport;
use crate::dialer;
use crate::protocol::Frame;
use crate::state::{AgentState, SWEEP_INTERVAL};

/// How long to wait before reconnecting after a disconnect or dial error.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Errors that end the agent process.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("server rejected the API key")]
    Unauthorized,
}

pub struct AgentConfig {
    pub api_key: String,
    pub server_host: String,
    pub server_port: u16,
}

/// Runs the control loop forever: connect, register, dispatch frames,
/// reconnect after [`RECONNECT_DELAY`] on any disconnect. Returns only on
/// a fatal error.
///
/// The single loop on one task is the re-entrancy guard: there is exactly
/// one outstanding connect attempt at any time.
pub async fn run(config: AgentConfig, state: Arc<AgentState>) -> Result<(), AgentError> {
    let addr = format!("{}:{}", config.server_host, config.server_port);

    loop {
        info!("Connecting to server: {}", addr);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("Connected to server");
                run_session(&config, &state, stream).await?;
                warn!("Disconnected from server");
            }
            Err(e) => {
                error!("Connection failed: {}", e);
            }
        }

        info!("Reconnecting in {}s...", RECONNECT_DELAY.as_secs());
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Runs one connected session until the socket drops. `Err` is fatal for
/// the process; `Ok(())` means reconnect.
async fn run_session(
    config: &AgentConfig,
    state: &Arc<AgentState>,
    stream: TcpStream,
) -> Result<(), AgentError> {
    let (mut sink, mut source) = FrameTransport::new(stream).split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let _ = tx.send(Frame::Register {
        api_key: config.api_key.clone(),
    });

    // ── Outbound Sender Task ──
    // Drains the frame queue and serializes each frame onto the socket.
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send_frame(&frame).await.is_err() {
                break;
            }
        }
    });

    // ── Heartbeat Task ──
    // Ages queued packets and reaps records stuck in the dialing state.
    let sweep_state = state.clone();
    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            sweep_state.sweep(Instant::now()).await;
        }
    });

    // ── Inbound Frame Loop ──
    let result = loop {
        match source.next_frame().await {
            Some(Frame::Registered { backend_id }) => {
                info!("Registered as backend {}", backend_id);
            }
            Some(Frame::Unauthorized) => {
                error!("Server rejected the API key");
                break Err(AgentError::Unauthorized);
            }
            Some(frame) => dialer::dispatch(state, &tx, frame).await,
            None => break Ok(()),
        }
    };

    // ── Disconnect Cleanup ──
    // Every local target connection dies with the control link; queued
    // packets are discarded with them.
    outbound.abort();
    heartbeat.abort();
    state.destroy_all().await;
    result
}

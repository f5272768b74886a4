//! # Request Session Relay
//!
//! Runs the server side of a single proxied end-user connection: bytes read
//! from the user socket become `data` frames on the backend's control
//! connection, and decoded bytes from the agent are written back to the
//! user socket.
//!
//! ## Data Flow
//!
//! ```text
//! user app <--TCP--> [relay task] <--frames--> backend session <--control TCP--> agent
//! ```
//!
//! The relay has two halves that end independently so half-closed
//! connections drain correctly:
//! 1. **user -> backend**: reads the user socket, base64-encodes, sends
//!    `data` frames; user FIN sends `end` and marks the session Closing.
//! 2. **backend -> user**: drains the session's byte channel into the user
//!    socket; the channel closing (agent `end`) half-closes the socket.
//!
//! The session entry is removed once both halves are done, or immediately
//! when the session's cancel token fires (agent `error`, backend loss,
//! idle sweep).

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::Frame;
use crate::state::{AppState, FrameTx, SessionState};

/// How often the sweeper looks for stuck sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Sessions that are not Connected and have seen no activity for this long
/// are destroyed. Connected sessions are exempt: a healthy proxied
/// connection may legitimately sit idle for minutes.
pub const PENDING_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Read buffer for the user socket; one read becomes one `data` frame.
const READ_BUF_BYTES: usize = 8192;

/// Runs the bidirectional relay for one request session. The session entry
/// must already be registered in `state.requests` under `request_id`.
pub async fn run_user_conn(
    state: AppState,
    request_id: String,
    backend_tx: FrameTx,
    stream: TcpStream,
    cancel: CancellationToken,
    user_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut user_read, mut user_write) = stream.into_split();

    // ── backend -> user ──
    // Ends when the channel closes: either the agent sent `end` (the
    // dispatcher drops the sender, and we half-close after draining) or
    // the session was destroyed.
    let mut writer = tokio::spawn(async move {
        let mut user_rx = user_rx;
        while let Some(bytes) = user_rx.recv().await {
            if user_write.write_all(&bytes).await.is_err() {
                return;
            }
        }
        let _ = user_write.shutdown().await;
    });

    // ── user -> backend ──
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = user_read.read(&mut buf) => match result {
                Ok(0) => {
                    // User FIN: graceful half-close toward the agent.
                    let _ = backend_tx.send(Frame::End {
                        request_id: request_id.clone(),
                    });
                    if let Some(mut session) = state.requests.get_mut(&request_id) {
                        session.state = SessionState::Closing;
                        session.last_activity = Instant::now();
                    }
                    break;
                }
                Ok(n) => {
                    let frame = Frame::Data {
                        request_id: request_id.clone(),
                        data: BASE64.encode(&buf[..n]),
                    };
                    if backend_tx.send(frame).is_err() {
                        // Backend session gone; teardown will cancel us,
                        // but don't spin until it does.
                        break;
                    }
                    if let Some(mut session) = state.requests.get_mut(&request_id) {
                        session.last_activity = Instant::now();
                    }
                }
                Err(e) => {
                    // User socket error: destroy the session, no frame.
                    debug!("Request {} user read error: {}", request_id, e);
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    // Let the backend -> user half drain (half-close), unless the session
    // is being torn down abortively.
    tokio::select! {
        _ = cancel.cancelled() => writer.abort(),
        _ = &mut writer => {}
    }

    state.requests.remove(&request_id);
    debug!("Request {} finished", request_id);
}

/// Destroys sessions stuck outside the Connected state with no activity
/// for [`PENDING_IDLE_TIMEOUT`]. No frame is sent for idle kills.
pub fn sweep_idle_sessions(state: &AppState) {
    let now = Instant::now();
    let stale: Vec<String> = state
        .requests
        .iter()
        .filter(|entry| {
            entry.value().state != SessionState::Connected
                && now.duration_since(entry.value().last_activity) > PENDING_IDLE_TIMEOUT
        })
        .map(|entry| entry.key().clone())
        .collect();

    for request_id in stale {
        info!("Destroying idle request session {}", request_id);
        state.destroy_request(&request_id);
    }
}

/// Periodic sweep task; one per server process.
pub async fn run_idle_sweeper(state: AppState) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        sweep_idle_sessions(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RequestSession;

    fn insert_session(state: &AppState, request_id: &str, session_state: SessionState, age: Duration) {
        let (user_tx, _user_rx) = mpsc::unbounded_channel();
        state.requests.insert(
            request_id.to_string(),
            RequestSession {
                backend_id: "b1".to_string(),
                tunnel_id: "t1".to_string(),
                user_tx: Some(user_tx),
                state: session_state,
                last_activity: Instant::now() - age,
                cancel: CancellationToken::new(),
            },
        );
    }

    #[tokio::test]
    async fn sweep_kills_stale_pending_sessions() {
        let state = AppState::new();
        insert_session(&state, "stale", SessionState::Pending, Duration::from_secs(20));
        insert_session(&state, "fresh", SessionState::Pending, Duration::from_secs(1));

        sweep_idle_sessions(&state);

        assert!(!state.requests.contains_key("stale"));
        assert!(state.requests.contains_key("fresh"));
    }

    #[tokio::test]
    async fn sweep_spares_connected_sessions() {
        let state = AppState::new();
        insert_session(
            &state,
            "idle-but-connected",
            SessionState::Connected,
            Duration::from_secs(60),
        );
        insert_session(&state, "stuck-closing", SessionState::Closing, Duration::from_secs(20));

        sweep_idle_sessions(&state);

        assert!(state.requests.contains_key("idle-but-connected"));
        assert!(!state.requests.contains_key("stuck-closing"));
    }

    #[tokio::test]
    async fn sweep_cancels_the_session_token() {
        let state = AppState::new();
        let cancel = CancellationToken::new();
        let (user_tx, _user_rx) = mpsc::unbounded_channel();
        state.requests.insert(
            "r1".to_string(),
            RequestSession {
                backend_id: "b1".to_string(),
                tunnel_id: "t1".to_string(),
                user_tx: Some(user_tx),
                state: SessionState::Pending,
                last_activity: Instant::now() - Duration::from_secs(30),
                cancel: cancel.clone(),
            },
        );

        sweep_idle_sessions(&state);
        assert!(cancel.is_cancelled());
    }
}

//! # Backend Control Session
//!
//! Server-side lifecycle of one agent's control connection:
//! - Registration: the first frame must be `register`; the API key is
//!   resolved through the registry and anything else terminates the
//!   connection.
//! - Dispatch: response frames from the agent are demultiplexed onto the
//!   request sessions they belong to.
//! - Teardown: when the control socket closes, every request session bound
//!   to the backend is destroyed. The agent reconnects on its own; the
//!   server does nothing proactive.

use std::net::SocketAddr;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::FrameTransport;
use crate::protocol::Frame;
use crate::state::{AppState, BackendHandle, SessionState};

/// Manages the full lifecycle of a single control connection.
///
/// ## Flow:
/// 1. Wait for `register` and resolve the API key (nothing else is
///    accepted first)
/// 2. Evict any previous session for the same backend ID
/// 3. Spawn an outbound task that serializes queued frames onto the socket
/// 4. Dispatch incoming frames on the current task
/// 5. On disconnect: remove the session and destroy its request sessions
pub async fn handle_control_conn(state: AppState, stream: TcpStream, peer: SocketAddr) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New control connection {} from {}", conn_id, peer);

    let (mut sink, mut source) = FrameTransport::new(stream).split();

    // ── Registration ──
    // Invariant: no frame other than `register` may appear before the
    // session is registered; violators terminate the connection.
    let backend_id = match source.next_frame().await {
        Some(Frame::Register { api_key }) => match state.registry.resolve_api_key(&api_key) {
            Some(backend_id) => backend_id,
            None => {
                warn!("Control connection {} presented an unknown API key", conn_id);
                let _ = sink.send_frame(&Frame::Unauthorized).await;
                return;
            }
        },
        Some(frame) => {
            warn!(
                "Control connection {} sent {:?} before registering, closing",
                conn_id, frame
            );
            return;
        }
        None => {
            debug!("Control connection {} closed before registering", conn_id);
            return;
        }
    };

    // A second successful register supersedes the first: close the earlier
    // socket and destroy the request sessions riding on it.
    if let Some((_, old)) = state.backends.remove(&backend_id) {
        info!(
            "Backend {} re-registered, superseding connection {}",
            backend_id, old.conn_id
        );
        old.cancel.cancel();
        state.destroy_backend_requests(&backend_id);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let cancel = CancellationToken::new();
    state.backends.insert(
        backend_id.clone(),
        BackendHandle {
            conn_id: conn_id.clone(),
            tx: tx.clone(),
            cancel: cancel.clone(),
        },
    );
    info!("Backend {} registered (conn={})", backend_id, conn_id);

    let _ = tx.send(Frame::Registered {
        backend_id: backend_id.clone(),
    });

    // ── Outbound Task ──
    // The single writer for this control socket: drains the frame queue in
    // order so frames never interleave mid-line, and keeps slow control
    // sockets from back-pressuring the user-socket readers.
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send_frame(&frame).await.is_err() {
                break;
            }
        }
    });

    // ── Inbound Dispatch ──
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => match frame {
                Some(frame) => dispatch(&state, &backend_id, frame),
                None => break,
            }
        }
    }

    // ── Teardown ──
    info!("Backend {} disconnected (conn={})", backend_id, conn_id);
    outbound.abort();

    // Only tear down if we are still the live session; a newer register
    // may have replaced us and now owns the backend's request sessions.
    let still_live = state
        .backends
        .remove_if(&backend_id, |_, handle| handle.conn_id == conn_id)
        .is_some();
    if still_live {
        state.destroy_backend_requests(&backend_id);
    }
}

/// Routes one agent frame to the request session it belongs to. Frames for
/// unknown request IDs, or for sessions owned by a different backend, are
/// dropped.
fn dispatch(state: &AppState, backend_id: &str, frame: Frame) {
    match frame {
        Frame::Connect { request_id } => {
            if let Some(mut session) = state.requests.get_mut(&request_id) {
                if session.backend_id == backend_id && session.state == SessionState::Pending {
                    session.state = SessionState::Connected;
                    session.last_activity = Instant::now();
                    debug!("Request {} connected", request_id);
                }
            }
        }

        Frame::Data { request_id, data } => {
            let bytes = match BASE64.decode(&data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Request {}: dropping undecodable data frame: {}", request_id, e);
                    return;
                }
            };
            if let Some(mut session) = state.requests.get_mut(&request_id) {
                if session.backend_id != backend_id {
                    return;
                }
                session.last_activity = Instant::now();
                // user_tx is None once the user side is closed for writing;
                // late data frames are dropped.
                if let Some(user_tx) = &session.user_tx {
                    let _ = user_tx.send(bytes);
                }
            }
        }

        Frame::End { request_id } => {
            if let Some(mut session) = state.requests.get_mut(&request_id) {
                if session.backend_id != backend_id {
                    return;
                }
                debug!("Request {} half-closed by agent", request_id);
                session.state = SessionState::Closing;
                session.last_activity = Instant::now();
                // Dropping the sender lets the user writer drain, then
                // shut down the write half.
                session.user_tx.take();
            }
        }

        Frame::Error { request_id, error } => {
            let owned = state
                .requests
                .get(&request_id)
                .map(|session| session.backend_id == backend_id)
                .unwrap_or(false);
            if owned {
                warn!("Request {} failed on the agent side: {}", request_id, error);
                state.destroy_request(&request_id);
            }
        }

        // `register` on an already-registered session, or server-only
        // frames echoed back. Harmless; log and ignore.
        other => {
            warn!(
                "Backend {} sent unexpected frame {:?}, ignoring",
                backend_id, other
            );
        }
    }
}

//! # Tunnel Listener
//!
//! One TCP listener per active tunnel mapping, bound to the mapping's
//! public port. Each accepted end-user connection gets a fresh request ID
//! and a request session bound to the mapping's backend, and the agent is
//! told to dial the target with a `request` frame.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::protocol::Frame;
use crate::registry::TunnelMapping;
use crate::session;
use crate::state::{generate_request_id, AppState, RequestSession, SessionState};

/// Binds `0.0.0.0:port` with SO_REUSEADDR so a stopped tunnel's port can be
/// reclaimed immediately despite sockets lingering in TIME_WAIT.
pub fn bind_tunnel_port(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Spawns the accept loop for one tunnel. The loop runs until the cancel
/// token fires (tunnel stopped) or the listener errors.
pub fn spawn_accept_loop(
    state: AppState,
    listener: TcpListener,
    mapping: TunnelMapping,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        "Tunnel {}:{} listener stopped",
                        mapping.backend_id, mapping.tunnel_id
                    );
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => handle_user_accept(&state, &mapping, stream, peer),
                    Err(e) => {
                        error!(
                            "Accept error on port {}: {}",
                            mapping.server_port, e
                        );
                        break;
                    }
                }
            }
        }
    });
}

/// Admits one end-user connection: mints the request ID, registers the
/// session, tells the agent to dial, and hands the socket to the relay.
fn handle_user_accept(state: &AppState, mapping: &TunnelMapping, stream: TcpStream, peer: SocketAddr) {
    // No live backend session means nobody can dial the target; drop the
    // client immediately rather than letting it hang.
    let backend_tx = match state.backends.get(&mapping.backend_id) {
        Some(backend) => backend.tx.clone(),
        None => {
            debug!(
                "Dropping connection from {}: backend {} is offline",
                peer, mapping.backend_id
            );
            return;
        }
    };

    let request_id = generate_request_id();
    info!(
        "New request {} from {} (tunnel {}:{})",
        request_id, peer, mapping.backend_id, mapping.tunnel_id
    );

    let (user_tx, user_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let cancel = CancellationToken::new();
    state.requests.insert(
        request_id.clone(),
        RequestSession {
            backend_id: mapping.backend_id.clone(),
            tunnel_id: mapping.tunnel_id.clone(),
            user_tx: Some(user_tx),
            state: SessionState::Pending,
            last_activity: Instant::now(),
            cancel: cancel.clone(),
        },
    );

    // Sent exactly once; a session whose agent never answers stays Pending
    // and is reaped by the idle sweep.
    let _ = backend_tx.send(Frame::Request {
        request_id: request_id.clone(),
        tunnel_id: mapping.tunnel_id.clone(),
        local_port: mapping.local_port,
        target_ip: mapping.target_host.clone(),
    });

    tokio::spawn(session::run_user_conn(
        state.clone(),
        request_id,
        backend_tx,
        stream,
        cancel,
        user_rx,
    ));
}

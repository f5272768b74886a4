//! # Target Dialer
//!
//! Handles the agent side of one proxied request: dialing the target with
//! bounded retries, draining the pre-connect packet queue, and piping bytes
//! between the target socket and the control connection.
//!
//! ## Data Flow
//!
//! ```text
//! server --'request'--> [dial task] --TCP--> target
//! server --'data'-----> queue (while dialing) / target writer
//! target bytes --------> 'data' frames --> server
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::Frame;
use crate::state::{AgentState, FrameTx, TargetConn};

/// Per-attempt dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Total dial attempts before giving up on a request.
pub const DIAL_ATTEMPTS: u32 = 3;
/// Pause between dial attempts.
pub const DIAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Keepalive idle time on the target socket, so a silently dead target is
/// noticed quickly.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(1);

/// Read buffer for the target socket; one read becomes one `data` frame.
const READ_BUF_BYTES: usize = 8192;

/// Routes one server frame to the record it belongs to. Registration
/// frames are consumed by the control loop before this is reached.
pub async fn dispatch(state: &Arc<AgentState>, tx: &FrameTx, frame: Frame) {
    match frame {
        Frame::Request {
            request_id,
            tunnel_id: _,
            local_port,
            target_ip,
        } => {
            if state.conns.read().await.contains_key(&request_id) {
                warn!("Duplicate request frame for {}, ignoring", request_id);
                return;
            }
            handle_request(state, tx, request_id, local_port, target_ip).await;
        }

        Frame::Data { request_id, data } => handle_data(state, &request_id, &data).await,

        Frame::End { request_id } => {
            // Graceful: drop the record. Dropping target_tx half-closes the
            // target once the writer drains; the target reader keeps
            // forwarding the reply until the target's own FIN.
            if state.remove(&request_id).await.is_some() {
                debug!("Request {} half-closed by server", request_id);
            }
        }

        Frame::Error { request_id, error } => {
            warn!("Request {} aborted by server: {}", request_id, error);
            state.destroy(&request_id).await;
        }

        other => {
            warn!("Unexpected frame from server: {:?}, ignoring", other);
        }
    }
}

/// Registers the record and spawns the dial task for one request.
async fn handle_request(
    state: &Arc<AgentState>,
    tx: &FrameTx,
    request_id: String,
    local_port: u16,
    target_ip: String,
) {
    let conn = TargetConn::new();
    let cancel = conn.cancel.clone();
    state.conns.write().await.insert(request_id.clone(), conn);

    let addr = format!("{}:{}", target_ip, local_port);
    info!("Request {}: dialing {}", request_id, addr);

    let state = state.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        dial_and_relay(state, tx, request_id, addr, cancel).await;
    });
}

/// Applies one `data` frame: forward to the target if connected, queue it
/// if the dial is still in flight, drop it if the record is gone.
async fn handle_data(state: &Arc<AgentState>, request_id: &str, data: &str) {
    let bytes = match BASE64.decode(data) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Request {}: dropping undecodable data frame: {}", request_id, e);
            return;
        }
    };

    let mut conns = state.conns.write().await;
    let Some(conn) = conns.get_mut(request_id) else {
        return;
    };
    conn.last_activity = Instant::now();

    if conn.connected {
        if let Some(target_tx) = &conn.target_tx {
            let _ = target_tx.send(bytes);
        }
    } else {
        conn.enqueue(bytes);
    }
}

/// Dials the target, then runs the relay pumps until a terminal event.
async fn dial_and_relay(
    state: Arc<AgentState>,
    tx: FrameTx,
    request_id: String,
    addr: String,
    cancel: CancellationToken,
) {
    let stream = match dial_with_retries(&addr, &cancel).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Request {}: dial {} failed: {}", request_id, addr, e);
            if state.remove(&request_id).await.is_some() {
                let _ = tx.send(Frame::Error {
                    request_id,
                    error: e.to_string(),
                });
            }
            return;
        }
    };

    if let Err(e) = enable_keepalive(&stream) {
        debug!("Request {}: could not enable keepalive: {}", request_id, e);
    }

    let (target_tx, mut target_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Flip to connected and take the backlog under one lock, so no data
    // frame can slip between the backlog and the channel out of order.
    let backlog = {
        let mut conns = state.conns.write().await;
        let Some(conn) = conns.get_mut(&request_id) else {
            // Destroyed while dialing (end/error/reconnect). Drop the socket.
            return;
        };
        let now = Instant::now();
        conn.connected = true;
        conn.target_tx = Some(target_tx);
        conn.last_activity = now;
        conn.take_backlog(now)
    };

    let _ = tx.send(Frame::Connect {
        request_id: request_id.clone(),
    });
    info!("Request {}: connected to {}", request_id, addr);

    let (mut target_read, mut target_write) = stream.into_split();

    // ── server -> target ──
    // The queued pre-connect packets go first, in arrival order, then the
    // live channel. The channel closing (record removed) half-closes the
    // target after draining.
    let writer = tokio::spawn(async move {
        for bytes in backlog {
            if target_write.write_all(&bytes).await.is_err() {
                return;
            }
        }
        while let Some(bytes) = target_rx.recv().await {
            if target_write.write_all(&bytes).await.is_err() {
                return;
            }
        }
        let _ = target_write.shutdown().await;
    });

    // ── target -> server ──
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Abortive teardown; the destroyer already removed the record.
                writer.abort();
                return;
            }
            result = target_read.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Request {}: target closed", request_id);
                    let _ = tx.send(Frame::End {
                        request_id: request_id.clone(),
                    });
                    break;
                }
                Ok(n) => {
                    let frame = Frame::Data {
                        request_id: request_id.clone(),
                        data: BASE64.encode(&buf[..n]),
                    };
                    if tx.send(frame).is_err() {
                        // Control connection gone; reconnect cleanup owns the map.
                        writer.abort();
                        return;
                    }
                    if let Some(conn) = state.conns.write().await.get_mut(&request_id) {
                        conn.last_activity = Instant::now();
                    }
                }
                Err(e) => {
                    warn!("Request {}: target read error: {}", request_id, e);
                    let _ = tx.send(Frame::Error {
                        request_id: request_id.clone(),
                        error: e.to_string(),
                    });
                    writer.abort();
                    break;
                }
            }
        }
    }

    // Terminal on the target side: drop the record unless the server's
    // `end` already did. The writer drains anything still in flight.
    state.remove(&request_id).await;
}

/// Dials with up to [`DIAL_ATTEMPTS`] attempts, [`DIAL_TIMEOUT`] each,
/// pausing [`DIAL_RETRY_DELAY`] between attempts. The failed attempt's
/// socket is dropped before the next try.
async fn dial_with_retries(
    addr: &str,
    cancel: &CancellationToken,
) -> std::io::Result<TcpStream> {
    let mut last_err =
        std::io::Error::new(std::io::ErrorKind::TimedOut, "connection attempt timed out");

    for attempt in 1..=DIAL_ATTEMPTS {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "request cancelled",
                ));
            }
            result = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)) => match result {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    warn!("Dial {} attempt {}/{} failed: {}", addr, attempt, DIAL_ATTEMPTS, e);
                    last_err = e;
                }
                Err(_) => {
                    warn!("Dial {} attempt {}/{} timed out", addr, attempt, DIAL_ATTEMPTS);
                    last_err = std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection attempt timed out",
                    );
                }
            }
        }

        if attempt < DIAL_ATTEMPTS {
            tokio::time::sleep(DIAL_RETRY_DELAY).await;
        }
    }

    Err(last_err)
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

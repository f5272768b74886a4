//! # Server State
//!
//! Holds the shared state for the tunnel server:
//! - **Backend registry**: maps backend IDs to their control-session handles
//! - **Request registry**: maps request IDs to in-flight end-user sessions
//! - **Tunnel registry**: active mappings, listeners, and the API-key index
//!
//! The backend and request registries use [`DashMap`] for concurrent access,
//! since tunnel listeners, control sessions, and user-socket tasks all touch
//! them concurrently.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::Frame;
use crate::registry::TunnelRegistry;

/// Type alias for the unbounded sender feeding a control connection's
/// outbound writer task. Frames pushed here are serialized one per line,
/// in order, by a single writer, so they never interleave mid-line.
pub type FrameTx = mpsc::UnboundedSender<Frame>;

/// Generates a request ID: 16 random bytes, hex-encoded (32 characters).
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Handle to one live backend control session.
pub struct BackendHandle {
    /// Identifies the underlying control connection. A newer register for
    /// the same backend ID supersedes the session; the old connection's
    /// teardown uses this to avoid removing its successor.
    pub conn_id: String,

    /// Channel to the session's outbound writer task.
    pub tx: FrameTx,

    /// Cancelling this aborts the control connection.
    pub cancel: CancellationToken,
}

/// Lifecycle state of one proxied end-user stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the agent's `connect` acknowledgment.
    Pending,
    /// The agent dialed the target; bytes are flowing.
    Connected,
    /// One side sent `end`/FIN; draining the other direction.
    Closing,
}

/// One end-user connection being proxied, keyed by request ID.
pub struct RequestSession {
    pub backend_id: String,
    pub tunnel_id: String,

    /// Sender feeding decoded agent bytes to the user-socket writer.
    /// Taken (dropped) on `end` from the agent to half-close the user
    /// socket; `None` also means further `data` frames are dropped.
    pub user_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,

    pub state: SessionState,

    /// Updated on every frame in either direction for this request.
    pub last_activity: Instant,

    /// Cancelling this abortively closes the user socket.
    pub cancel: CancellationToken,
}

/// Shared server state, cloned into every listener and control session.
#[derive(Clone)]
pub struct AppState {
    /// Live backend control sessions, keyed by backend ID.
    pub backends: Arc<DashMap<String, BackendHandle>>,

    /// In-flight request sessions, keyed by request ID.
    pub requests: Arc<DashMap<String, RequestSession>>,

    /// Active tunnel mappings and the API-key index.
    pub registry: Arc<TunnelRegistry>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            backends: Arc::new(DashMap::new()),
            requests: Arc::new(DashMap::new()),
            registry: Arc::new(TunnelRegistry::new()),
        }
    }

    /// Abortively destroys one request session, if it still exists.
    pub fn destroy_request(&self, request_id: &str) {
        if let Some((_, session)) = self.requests.remove(request_id) {
            session.cancel.cancel();
        }
    }

    /// Destroys every request session bound to the given backend. Called
    /// when a backend control session is lost or superseded.
    pub fn destroy_backend_requests(&self, backend_id: &str) {
        let doomed: Vec<String> = self
            .requests
            .iter()
            .filter(|entry| entry.value().backend_id == backend_id)
            .map(|entry| entry.key().clone())
            .collect();

        for request_id in doomed {
            self.destroy_request(&request_id);
        }
    }

    /// Destroys every request session belonging to one tunnel mapping.
    pub fn destroy_tunnel_requests(&self, backend_id: &str, tunnel_id: &str) {
        let doomed: Vec<String> = self
            .requests
            .iter()
            .filter(|entry| {
                entry.value().backend_id == backend_id && entry.value().tunnel_id == tunnel_id
            })
            .map(|entry| entry.key().clone())
            .collect();

        for request_id in doomed {
            self.destroy_request(&request_id);
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_32_hex_chars_and_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}

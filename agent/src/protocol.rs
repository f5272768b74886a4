//! # Control Protocol Frames (Agent)
//!
//! Frames exchanged with the tunnel server over the control connection,
//! as newline-delimited JSON records. This enum **must stay in sync** with
//! the server's `Frame` enum in `server/src/protocol.rs`; any change to
//! one must be mirrored in the other.

use serde::{Deserialize, Serialize};

/// All frames of the tunnel control protocol.
///
/// Uses serde's internally-tagged representation: each frame is one JSON
/// object with a `"type"` field (e.g. `{"type": "register", ...}`) and
/// camelCase field names.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// First frame on a fresh control connection; carries our API key.
    Register { api_key: String },

    /// Registration succeeded; carries the backend ID the key resolved to.
    Registered { backend_id: String },

    /// Registration failed: unknown API key. Fatal; the process exits.
    Unauthorized,

    /// The server accepted an end-user connection; dial the target and
    /// answer with `Connect` when the dial completes.
    Request {
        request_id: String,
        tunnel_id: String,
        local_port: u16,
        target_ip: String,
    },

    /// Our dial to the target succeeded.
    Connect { request_id: String },

    /// Proxied bytes, base64-encoded, in either direction.
    Data { request_id: String, data: String },

    /// Graceful half-close for one request, in either direction.
    End { request_id: String },

    /// Abortive close for one request, in either direction.
    Error { request_id: String, error: String },
}

//! # Control Protocol Frames
//!
//! Defines the frames exchanged between the server and backend agents over
//! the control connection. Frames travel as newline-delimited JSON records
//! using serde's internally-tagged representation (`"type": "..."` field).

use serde::{Deserialize, Serialize};

/// All frames of the tunnel control protocol.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the snake_case
/// variant name; fields are camelCase on the wire. For example,
/// `Frame::Connect { request_id }` serializes to
/// `{"type": "connect", "requestId": "..."}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    // ── Registration ──────────────────────────────────────────────
    /// Sent by an agent as the first frame on a fresh control connection.
    /// The server resolves the API key to a backend identity; nothing else
    /// is accepted until registration succeeds.
    Register { api_key: String },

    /// Server's acknowledgment of a successful registration, carrying the
    /// backend ID the key resolved to.
    Registered { backend_id: String },

    /// Registration failed: the API key is unknown. Fatal for the agent;
    /// the server closes the connection after sending this.
    Unauthorized,

    // ── Request Lifecycle ─────────────────────────────────────────
    /// A new end-user connection was accepted on a tunnel port. The agent
    /// should dial `targetIp:localPort` and answer with `Connect` once the
    /// dial succeeds.
    Request {
        request_id: String,
        tunnel_id: String,
        local_port: u16,
        target_ip: String,
    },

    /// Sent by the agent once its dial to the target completed.
    Connect { request_id: String },

    // ── Data Relay ────────────────────────────────────────────────
    /// Carries proxied TCP bytes in either direction. The payload is the
    /// base64 of the raw bytes; no length or checksum field is transmitted.
    Data { request_id: String, data: String },

    /// Graceful half-close: the sending side saw EOF on its socket for this
    /// request. Sent in either direction.
    End { request_id: String },

    /// Abortive close for one request, with a human-readable reason.
    /// Sent in either direction; never terminates the control connection.
    Error { request_id: String, error: String },
}

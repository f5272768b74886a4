//! # Tunnel Registry
//!
//! In-memory catalogue of active tunnel mappings and their listeners, plus
//! the API-key index used to authenticate backend registrations. The admin
//! plane (REST API, persistence) lives outside this crate and drives the
//! registry through these methods; the core itself keeps nothing on disk.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::listener;
use crate::state::AppState;

/// First port tried by [`TunnelRegistry::find_available_port`].
pub const PORT_SCAN_MIN: u16 = 10000;
/// Last port tried by [`TunnelRegistry::find_available_port`].
pub const PORT_SCAN_MAX: u16 = 65535;

/// One public-port-to-target mapping. Identity is `(backend_id, tunnel_id)`;
/// at most one active mapping may claim a given `server_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelMapping {
    pub backend_id: String,
    pub tunnel_id: String,
    /// Public port the server listens on.
    pub server_port: u16,
    /// Port the agent dials on its local network.
    pub local_port: u16,
    /// Host the agent dials on its local network.
    pub target_host: String,
}

impl TunnelMapping {
    /// Parses mappings from a comma-separated env string of
    /// `backendId:tunnelId:serverPort:localPort:targetHost` entries, e.g.
    /// `b1:t1:10080:8080:127.0.0.1,b1:t2:10443:8443:127.0.0.1`.
    /// Malformed entries are skipped.
    pub fn parse_from_env(raw: &str) -> Vec<Self> {
        raw.split(',')
            .filter_map(|entry| {
                let parts: Vec<&str> = entry.trim().split(':').collect();
                if parts.len() == 5 {
                    Some(TunnelMapping {
                        backend_id: parts[0].to_string(),
                        tunnel_id: parts[1].to_string(),
                        server_port: parts[2].parse().ok()?,
                        local_port: parts[3].parse().ok()?,
                        target_host: parts[4].to_string(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn key(&self) -> TunnelKey {
        (self.backend_id.clone(), self.tunnel_id.clone())
    }
}

pub type TunnelKey = (String, String);

/// Registry failures surfaced to the admin-plane caller. Listener errors
/// stop at this boundary; they never affect other tunnels or backends.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("port {0} is already claimed by another tunnel")]
    PortInUse(u16),

    #[error("tunnel {backend_id}:{tunnel_id} is already active")]
    TunnelExists {
        backend_id: String,
        tunnel_id: String,
    },

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no listener ports available in {PORT_SCAN_MIN}-{PORT_SCAN_MAX}")]
    NoPortsAvailable,
}

struct TunnelHandle {
    mapping: TunnelMapping,
    /// Cancelling this stops the accept loop and releases the port.
    cancel: CancellationToken,
}

/// Snapshot of the registry and its dependent state, serialized for the
/// admin plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Active tunnel keys as `backendId:tunnelId`.
    pub tunnels: Vec<String>,
    /// Backend IDs with a live control session.
    pub backends: Vec<String>,
    /// Number of in-flight request sessions.
    pub active_requests: usize,
    pub mappings: Vec<TunnelMapping>,
}

pub struct TunnelRegistry {
    tunnels: DashMap<TunnelKey, TunnelHandle>,
    ports: DashMap<u16, TunnelMapping>,
    /// API key to backend ID. Populated by the admin plane; the core only
    /// resolves, never persists.
    api_keys: DashMap<String, String>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            ports: DashMap::new(),
            api_keys: DashMap::new(),
        }
    }

    // ── Tunnel Lifecycle ──────────────────────────────────────────

    /// Binds the mapping's public port and starts accepting end-user
    /// connections for it. On error no state is left behind.
    pub fn create_tunnel(
        &self,
        state: &AppState,
        mapping: TunnelMapping,
    ) -> Result<(), RegistryError> {
        let key = mapping.key();
        if self.tunnels.contains_key(&key) {
            return Err(RegistryError::TunnelExists {
                backend_id: key.0,
                tunnel_id: key.1,
            });
        }

        // The port entry doubles as the reservation: holding the vacant
        // slot while binding keeps a racing create_tunnel out.
        let tcp = match self.ports.entry(mapping.server_port) {
            Entry::Occupied(_) => return Err(RegistryError::PortInUse(mapping.server_port)),
            Entry::Vacant(slot) => {
                let tcp = listener::bind_tunnel_port(mapping.server_port).map_err(|source| {
                    RegistryError::Bind {
                        port: mapping.server_port,
                        source,
                    }
                })?;
                slot.insert(mapping.clone());
                tcp
            }
        };

        let cancel = CancellationToken::new();
        self.tunnels.insert(
            key,
            TunnelHandle {
                mapping: mapping.clone(),
                cancel: cancel.clone(),
            },
        );

        info!(
            "Tunnel {}:{} listening on port {} -> {}:{}",
            mapping.backend_id,
            mapping.tunnel_id,
            mapping.server_port,
            mapping.target_host,
            mapping.local_port
        );
        listener::spawn_accept_loop(state.clone(), tcp, mapping, cancel);
        Ok(())
    }

    /// Stops a tunnel: the listener stops accepting, every in-flight
    /// request session of the mapping is destroyed, and both index entries
    /// are removed.
    pub fn stop_tunnel(&self, state: &AppState, backend_id: &str, tunnel_id: &str) {
        let key = (backend_id.to_string(), tunnel_id.to_string());
        match self.tunnels.remove(&key) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                self.ports.remove(&handle.mapping.server_port);
                state.destroy_tunnel_requests(backend_id, tunnel_id);
                info!(
                    "Stopped tunnel {}:{} (port {})",
                    backend_id, tunnel_id, handle.mapping.server_port
                );
            }
            None => {
                warn!("Attempted to stop unknown tunnel {}:{}", backend_id, tunnel_id);
            }
        }
    }

    // ── Port Allocation ───────────────────────────────────────────

    /// True if no active mapping claims the port. Range validation is the
    /// caller's responsibility.
    pub fn is_port_available(&self, port: u16) -> bool {
        !self.ports.contains_key(&port)
    }

    /// First-fit scan over the listener port range.
    pub fn find_available_port(&self) -> Result<u16, RegistryError> {
        (PORT_SCAN_MIN..=PORT_SCAN_MAX)
            .find(|port| !self.ports.contains_key(port))
            .ok_or(RegistryError::NoPortsAvailable)
    }

    // ── API Keys ──────────────────────────────────────────────────

    pub fn add_backend(&self, backend_id: &str, api_key: &str) {
        self.api_keys
            .insert(api_key.to_string(), backend_id.to_string());
    }

    pub fn remove_backend(&self, backend_id: &str) {
        self.api_keys.retain(|_, id| id != backend_id);
    }

    /// Resolves a presented API key to a backend ID.
    pub fn resolve_api_key(&self, api_key: &str) -> Option<String> {
        self.api_keys.get(api_key).map(|entry| entry.value().clone())
    }

    // ── Introspection ─────────────────────────────────────────────

    pub fn status(&self, state: &AppState) -> StatusSnapshot {
        StatusSnapshot {
            tunnels: self
                .tunnels
                .iter()
                .map(|entry| format!("{}:{}", entry.key().0, entry.key().1))
                .collect(),
            backends: state
                .backends
                .iter()
                .map(|entry| entry.key().clone())
                .collect(),
            active_requests: state.requests.len(),
            mappings: self.ports.iter().map(|entry| entry.value().clone()).collect(),
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(backend_id: &str, tunnel_id: &str, server_port: u16) -> TunnelMapping {
        TunnelMapping {
            backend_id: backend_id.to_string(),
            tunnel_id: tunnel_id.to_string(),
            server_port,
            local_port: 8080,
            target_host: "127.0.0.1".to_string(),
        }
    }

    /// Grabs a port the OS considers free right now. The listener is
    /// dropped before returning, so a tiny reuse race remains; good enough
    /// for tests.
    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn parse_from_env_accepts_well_formed_entries() {
        let parsed =
            TunnelMapping::parse_from_env("b1:t1:10080:8080:127.0.0.1, b2:t9:10443:443:10.0.0.8");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], mapping("b1", "t1", 10080));
        assert_eq!(parsed[1].backend_id, "b2");
        assert_eq!(parsed[1].local_port, 443);
        assert_eq!(parsed[1].target_host, "10.0.0.8");
    }

    #[test]
    fn parse_from_env_skips_malformed_entries() {
        let parsed = TunnelMapping::parse_from_env("garbage,b1:t1:not-a-port:8080:host,b1:t1:10080:8080:h");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].server_port, 10080);
    }

    #[test]
    fn find_available_port_on_empty_registry_returns_scan_min() {
        let registry = TunnelRegistry::new();
        assert_eq!(registry.find_available_port().unwrap(), PORT_SCAN_MIN);
    }

    #[test]
    fn find_available_port_skips_claimed_ports() {
        let registry = TunnelRegistry::new();
        registry
            .ports
            .insert(PORT_SCAN_MIN, mapping("b1", "t1", PORT_SCAN_MIN));
        registry
            .ports
            .insert(PORT_SCAN_MIN + 1, mapping("b1", "t2", PORT_SCAN_MIN + 1));
        assert_eq!(registry.find_available_port().unwrap(), PORT_SCAN_MIN + 2);
    }

    #[test]
    fn is_port_available_consults_only_the_index() {
        let registry = TunnelRegistry::new();
        assert!(registry.is_port_available(10080));
        registry.ports.insert(10080, mapping("b1", "t1", 10080));
        assert!(!registry.is_port_available(10080));
    }

    #[test]
    fn resolves_api_keys() {
        let registry = TunnelRegistry::new();
        registry.add_backend("b1", "secret1");
        registry.add_backend("b2", "secret2");

        assert_eq!(registry.resolve_api_key("secret1").as_deref(), Some("b1"));
        assert_eq!(registry.resolve_api_key("secret2").as_deref(), Some("b2"));
        assert_eq!(registry.resolve_api_key("nope"), None);

        registry.remove_backend("b1");
        assert_eq!(registry.resolve_api_key("secret1"), None);
        assert_eq!(registry.resolve_api_key("secret2").as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn create_then_stop_leaves_no_trace() {
        let state = AppState::new();
        let port = free_port();

        state
            .registry
            .create_tunnel(&state, mapping("b1", "t1", port))
            .unwrap();
        assert!(!state.registry.is_port_available(port));
        let status = state.registry.status(&state);
        assert_eq!(status.tunnels, vec!["b1:t1".to_string()]);
        assert_eq!(status.mappings.len(), 1);

        state.registry.stop_tunnel(&state, "b1", "t1");
        assert!(state.registry.is_port_available(port));
        let status = state.registry.status(&state);
        assert!(status.tunnels.is_empty());
        assert!(status.mappings.is_empty());
        assert_eq!(status.active_requests, 0);
    }

    #[tokio::test]
    async fn second_mapping_on_same_port_fails_with_port_in_use() {
        let state = AppState::new();
        let port = free_port();

        state
            .registry
            .create_tunnel(&state, mapping("b1", "t1", port))
            .unwrap();
        let err = state
            .registry
            .create_tunnel(&state, mapping("b2", "t2", port))
            .unwrap_err();
        assert!(matches!(err, RegistryError::PortInUse(p) if p == port));

        // The first tunnel is unaffected.
        assert_eq!(state.registry.status(&state).tunnels.len(), 1);
        state.registry.stop_tunnel(&state, "b1", "t1");
    }

    #[tokio::test]
    async fn duplicate_tunnel_key_is_rejected() {
        let state = AppState::new();
        let port = free_port();
        let other = free_port();

        state
            .registry
            .create_tunnel(&state, mapping("b1", "t1", port))
            .unwrap();
        let err = state
            .registry
            .create_tunnel(&state, mapping("b1", "t1", other))
            .unwrap_err();
        assert!(matches!(err, RegistryError::TunnelExists { .. }));

        state.registry.stop_tunnel(&state, "b1", "t1");
    }

    #[tokio::test]
    async fn failed_bind_leaves_no_partial_state() {
        let state = AppState::new();

        // Hold the port so create_tunnel's bind fails.
        let _blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = _blocker.local_addr().unwrap().port();

        let err = state
            .registry
            .create_tunnel(&state, mapping("b1", "t1", port))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Bind { .. }));
        assert!(state.registry.is_port_available(port));
        assert!(state.registry.status(&state).tunnels.is_empty());
    }
}

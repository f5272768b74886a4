//! # Agent State
//!
//! The agent's view of in-flight requests: one [`TargetConn`] per request
//! ID, holding the dial state, the channel to the target-socket writer,
//! and the pre-connect packet queue.
//!
//! The queue exists because the server starts forwarding end-user bytes as
//! soon as it accepts the connection, while our dial to the target may
//! still be in flight. Queued packets are bounded ([`PACKET_QUEUE_CAP`])
//! and aged out ([`PACKET_TTL`]) so a target that never answers cannot
//! pin memory.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::protocol::Frame;

/// Channel feeding the control connection's outbound writer task.
pub type FrameTx = mpsc::UnboundedSender<Frame>;

/// Maximum queued pre-connect packets per request; overflow drops the
/// oldest entry.
pub const PACKET_QUEUE_CAP: usize = 1000;

/// Queued packets older than this never reach the target.
pub const PACKET_TTL: Duration = Duration::from_secs(60);

/// How often the heartbeat ages queues and reaps stuck records.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Records that are still dialing with no activity for this long are
/// destroyed. Connected records are exempt, mirroring the server's policy:
/// a healthy proxied connection may idle for minutes.
pub const PENDING_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// One request's target-side connection state.
pub struct TargetConn {
    /// False while the dial is still in flight.
    pub connected: bool,

    /// Sender feeding the target-socket writer once connected. Dropping it
    /// (by removing the record) half-closes the target after draining.
    pub target_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Pre-connect packets in arrival order with their arrival times.
    pub queue: VecDeque<(Vec<u8>, Instant)>,

    pub last_activity: Instant,

    /// Cancelling this aborts the dial and the relay pumps.
    pub cancel: CancellationToken,
}

impl TargetConn {
    pub fn new() -> Self {
        Self {
            connected: false,
            target_tx: None,
            queue: VecDeque::new(),
            last_activity: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Queues one pre-connect packet, dropping the oldest on overflow.
    pub fn enqueue(&mut self, bytes: Vec<u8>) {
        if self.queue.len() >= PACKET_QUEUE_CAP {
            self.queue.pop_front();
        }
        self.queue.push_back((bytes, Instant::now()));
    }

    /// Drops expired packets. Arrival order means the stalest entries sit
    /// at the front.
    pub fn drop_aged(&mut self, now: Instant) {
        while let Some((_, arrived)) = self.queue.front() {
            if now.duration_since(*arrived) > PACKET_TTL {
                self.queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drains the queue in arrival order, skipping expired packets.
    pub fn take_backlog(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.queue
            .drain(..)
            .filter(|(_, arrived)| now.duration_since(*arrived) <= PACKET_TTL)
            .map(|(bytes, _)| bytes)
            .collect()
    }
}

impl Default for TargetConn {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared agent state: the request-ID keyed connection table.
pub struct AgentState {
    pub conns: RwLock<HashMap<String, TargetConn>>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Removes a record without cancelling its pumps (graceful paths:
    /// server `end`, target FIN).
    pub async fn remove(&self, request_id: &str) -> Option<TargetConn> {
        self.conns.write().await.remove(request_id)
    }

    /// Abortively destroys one record, if present.
    pub async fn destroy(&self, request_id: &str) -> bool {
        match self.conns.write().await.remove(request_id) {
            Some(conn) => {
                conn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Destroys every record. Called when the control connection drops;
    /// queued packets are discarded with the records.
    pub async fn destroy_all(&self) {
        let mut conns = self.conns.write().await;
        if conns.is_empty() {
            return;
        }
        info!("Destroying {} local connections", conns.len());
        for (_, conn) in conns.drain() {
            conn.cancel.cancel();
        }
    }

    /// Heartbeat sweep: ages queued packets everywhere and destroys
    /// records stuck in the dialing state past [`PENDING_IDLE_TIMEOUT`].
    pub async fn sweep(&self, now: Instant) {
        let mut conns = self.conns.write().await;
        for conn in conns.values_mut() {
            conn.drop_aged(now);
        }

        let stale: Vec<String> = conns
            .iter()
            .filter(|(_, conn)| {
                !conn.connected && now.duration_since(conn.last_activity) > PENDING_IDLE_TIMEOUT
            })
            .map(|(request_id, _)| request_id.clone())
            .collect();

        for request_id in stale {
            if let Some(conn) = conns.remove(&request_id) {
                info!("Destroying stale pre-connect record {}", request_id);
                conn.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_overflow_drops_the_oldest_packet() {
        let mut conn = TargetConn::new();
        for i in 0..PACKET_QUEUE_CAP + 1 {
            conn.enqueue(vec![(i % 251) as u8]);
        }

        assert_eq!(conn.queue.len(), PACKET_QUEUE_CAP);
        // Packet 0 was dropped; packet 1 is now at the front.
        assert_eq!(conn.queue.front().unwrap().0, vec![1u8]);
        assert_eq!(
            conn.queue.back().unwrap().0,
            vec![(PACKET_QUEUE_CAP % 251) as u8]
        );
    }

    #[test]
    fn aged_packets_never_reach_the_backlog() {
        let mut conn = TargetConn::new();
        let now = Instant::now();
        conn.queue
            .push_back((b"stale".to_vec(), now - PACKET_TTL - Duration::from_secs(1)));
        conn.queue.push_back((b"fresh".to_vec(), now));

        let backlog = conn.take_backlog(now);
        assert_eq!(backlog, vec![b"fresh".to_vec()]);
    }

    #[test]
    fn drop_aged_evicts_only_expired_entries() {
        let mut conn = TargetConn::new();
        let now = Instant::now();
        conn.queue
            .push_back((b"old1".to_vec(), now - PACKET_TTL - Duration::from_secs(5)));
        conn.queue
            .push_back((b"old2".to_vec(), now - PACKET_TTL - Duration::from_secs(1)));
        conn.queue.push_back((b"live".to_vec(), now));

        conn.drop_aged(now);
        assert_eq!(conn.queue.len(), 1);
        assert_eq!(conn.queue.front().unwrap().0, b"live".to_vec());
    }

    #[tokio::test]
    async fn sweep_reaps_stale_dialing_records_only() {
        let state = AgentState::new();
        {
            let mut conns = state.conns.write().await;

            let mut stuck = TargetConn::new();
            stuck.last_activity = Instant::now() - Duration::from_secs(20);
            conns.insert("stuck".to_string(), stuck);

            let mut connected = TargetConn::new();
            connected.connected = true;
            connected.last_activity = Instant::now() - Duration::from_secs(60);
            conns.insert("connected".to_string(), connected);

            conns.insert("fresh".to_string(), TargetConn::new());
        }

        state.sweep(Instant::now()).await;

        let conns = state.conns.read().await;
        assert!(!conns.contains_key("stuck"));
        assert!(conns.contains_key("connected"));
        assert!(conns.contains_key("fresh"));
    }

    #[tokio::test]
    async fn destroy_all_cancels_every_record() {
        let state = AgentState::new();
        let token = {
            let mut conns = state.conns.write().await;
            let conn = TargetConn::new();
            let token = conn.cancel.clone();
            conns.insert("r1".to_string(), conn);
            token
        };

        state.destroy_all().await;
        assert!(token.is_cancelled());
        assert!(state.conns.read().await.is_empty());
    }
}

//! Connection registry: every open streaming channel, addressed by an opaque id.
//!
//! The registry is the only owner of channel sinks. Everything else addresses a connection by id,
//! so a send to a connection that has already gone away is a logged no-op.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Opaque connection identifier (`conn-<uuid>`), never reused within a process.
pub type ConnectionId = String;

/// Item pushed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized text frame.
    Frame(String),
    /// Close the underlying socket.
    Close,
}

/// Frames a connection may have queued before it is treated as dead.
pub const OUTBOUND_QUEUE: usize = 256;

/// Sending half of one connection's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelSink {
    /// New sink plus the receiver the transport's writer task drains.
    pub fn new() -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(OUTBOUND_QUEUE)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// False when the peer is gone or has stopped draining its queue.
    fn push(&self, frame: String) -> bool {
        self.tx.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Best effort. If the queue is full, dropping the sink ends the writer once it drains.
    fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct ConnectionEntry {
    sink: ChannelSink,
    opened_at: DateTime<Utc>,
    last_seen_at: Instant,
}

/// Read-only view of a connection, handed to broadcast predicates and status reports.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub opened_at: DateTime<Utc>,
    pub last_seen_at: Instant,
}

/// Registry of connection ids to sinks. Shared across the gateway behind an `Arc`.
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Store the sink under a fresh id and return the id.
    pub fn register(&self, sink: ChannelSink) -> ConnectionId {
        let id = format!("conn-{}", uuid::Uuid::new_v4());
        let entry = ConnectionEntry {
            sink,
            opened_at: Utc::now(),
            last_seen_at: Instant::now(),
        };
        self.lock().insert(id.clone(), entry);
        log::debug!("connection registered: {}", id);
        id
    }

    /// Idempotent. Returns whether an entry was actually removed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            log::debug!("connection unregistered: {}", id);
        }
        removed
    }

    /// Deliver one frame. Unknown or closed ids drop the frame and return false.
    pub fn send(&self, id: &str, frame: String) -> bool {
        let mut g = self.lock();
        let Some(entry) = g.get(id) else {
            log::debug!("dropping reply for closed connection {}", id);
            return false;
        };
        if entry.sink.push(frame) {
            return true;
        }
        g.remove(id);
        log::debug!("connection {} sink closed or full; removed from registry", id);
        false
    }

    /// Mark activity on a connection for idle detection.
    pub fn touch(&self, id: &str, now: Instant) -> bool {
        match self.lock().get_mut(id) {
            Some(entry) => {
                entry.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Push a frame to every connection the predicate selects. The predicate runs on a snapshot,
    /// outside the registry lock, so it may call back into the registry. A dead or full sink is
    /// dropped without affecting the others. Returns the number of deliveries.
    pub fn broadcast<F>(&self, frame: &str, predicate: F) -> usize
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let snapshot: Vec<ConnectionInfo> = self.lock().iter().map(|(id, e)| e.info(id)).collect();
        let selected: Vec<ConnectionId> = snapshot
            .into_iter()
            .filter(|info| predicate(info))
            .map(|info| info.id)
            .collect();

        let mut g = self.lock();
        let mut delivered = 0;
        for id in selected {
            // Unregistered since the snapshot.
            let Some(entry) = g.get(&id) else { continue };
            if entry.sink.push(frame.to_string()) {
                delivered += 1;
            } else {
                g.remove(&id);
                log::debug!("broadcast: removed dead connection {}", id);
            }
        }
        delivered
    }

    /// Unregister and close every connection whose last activity is older than `idle_timeout`.
    pub fn sweep_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<ConnectionId> {
        let mut g = self.lock();
        let stale: Vec<ConnectionId> = g
            .iter()
            .filter(|(_, e)| {
                e.sink.is_closed() || now.saturating_duration_since(e.last_seen_at) > idle_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(entry) = g.remove(id) {
                entry.sink.close();
            }
        }
        stale
    }

    /// Unregister one connection and close its socket.
    pub fn close(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(entry) => {
                entry.sink.close();
                true
            }
            None => false,
        }
    }

    /// Close and forget every connection (shutdown).
    pub fn close_all(&self) -> usize {
        let drained: Vec<ConnectionEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.sink.close();
        }
        drained.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn info(&self, id: &str) -> Option<ConnectionInfo> {
        self.lock().get(id).map(|e| e.info(id))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionEntry {
    fn info(&self, id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_string(),
            opened_at: self.opened_at,
            last_seen_at: self.last_seen_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn register_yields_unique_ids() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let (sink, rx) = ChannelSink::new();
            receivers.push(rx);
            assert!(ids.insert(registry.register(sink)));
        }
        assert_eq!(registry.len(), 100);
    }

    #[tokio::test]
    async fn concurrent_registration_is_safe() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (sink, rx) = ChannelSink::new();
                (registry.register(sink), rx)
            }));
        }
        let mut ids = HashSet::new();
        let mut receivers = Vec::new();
        for t in tasks {
            let (id, rx) = t.await.unwrap();
            ids.insert(id);
            receivers.push(rx);
        }
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.len(), 32);
    }

    #[test]
    fn send_reaches_only_the_addressed_connection() {
        let registry = ConnectionRegistry::new();
        let (a_sink, mut a_rx) = ChannelSink::new();
        let (b_sink, mut b_rx) = ChannelSink::new();
        let a = registry.register(a_sink);
        let _b = registry.register(b_sink);
        assert!(registry.send(&a, "for-a".to_string()));
        assert_eq!(a_rx.try_recv().unwrap(), Outbound::Frame("for-a".to_string()));
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn unregister_is_idempotent_and_send_after_is_noop() {
        let registry = ConnectionRegistry::new();
        let (sink, _rx) = ChannelSink::new();
        let id = registry.register(sink);
        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert!(!registry.unregister("conn-unknown"));
        assert!(!registry.send(&id, "late".to_string()));
        assert!(!registry.send("conn-unknown", "x".to_string()));
    }

    #[test]
    fn send_to_dropped_receiver_removes_entry() {
        let registry = ConnectionRegistry::new();
        let (sink, rx) = ChannelSink::new();
        let id = registry.register(sink);
        drop(rx);
        assert!(!registry.send(&id, "x".to_string()));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn idle_sweep_removes_stale_connections_and_closes_them() {
        let registry = ConnectionRegistry::new();
        let (stale_sink, mut stale_rx) = ChannelSink::new();
        let (fresh_sink, _fresh_rx) = ChannelSink::new();
        let stale = registry.register(stale_sink);
        let fresh = registry.register(fresh_sink);

        let now = Instant::now() + Duration::from_millis(500);
        assert!(registry.touch(&fresh, now));
        let swept = registry.sweep_idle(now, Duration::from_millis(100));
        assert_eq!(swept, vec![stale.clone()]);
        assert_eq!(stale_rx.try_recv().unwrap(), Outbound::Close);
        assert!(!registry.send(&stale, "late".to_string()));
        assert!(registry.contains(&fresh));
        assert!(!registry.touch(&stale, now));
    }

    #[test]
    fn broadcast_isolates_dead_sinks_and_honors_predicate() {
        let registry = ConnectionRegistry::new();
        let (a_sink, mut a_rx) = ChannelSink::new();
        let (b_sink, b_rx) = ChannelSink::new();
        let (c_sink, mut c_rx) = ChannelSink::new();
        let a = registry.register(a_sink);
        let b = registry.register(b_sink);
        let c = registry.register(c_sink);
        drop(b_rx);

        let delivered = registry.broadcast("tick", |_| true);
        assert_eq!(delivered, 2);
        assert_eq!(a_rx.try_recv().unwrap(), Outbound::Frame("tick".to_string()));
        assert_eq!(c_rx.try_recv().unwrap(), Outbound::Frame("tick".to_string()));
        assert!(!registry.contains(&b));

        let only_a = registry.broadcast("only-a", |info| info.id == a);
        assert_eq!(only_a, 1);
        assert!(c_rx.try_recv().is_err());
        assert!(registry.contains(&c));
    }

    #[test]
    fn broadcast_predicate_may_query_the_registry() {
        let registry = ConnectionRegistry::new();
        let (sink, mut rx) = ChannelSink::new();
        let id = registry.register(sink);
        let delivered = registry.broadcast("tick", |info| registry.contains(&info.id));
        assert_eq!(delivered, 1);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame("tick".to_string()));
        assert!(registry.info(&id).is_some());
    }

    #[test]
    fn full_queue_marks_connection_dead() {
        let registry = ConnectionRegistry::new();
        let (sink, mut rx) = ChannelSink::with_capacity(2);
        let id = registry.register(sink);
        assert!(registry.send(&id, "1".to_string()));
        assert!(registry.send(&id, "2".to_string()));
        assert!(!registry.send(&id, "3".to_string()));
        assert!(!registry.contains(&id));

        // Queued frames still drain, then the channel reports closed.
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame("1".to_string()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame("2".to_string()));
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn close_all_drains_registry() {
        let registry = ConnectionRegistry::new();
        let (sink, mut rx) = ChannelSink::new();
        registry.register(sink);
        assert_eq!(registry.close_all(), 1);
        assert!(registry.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }
}

//! # Broadcast Hub
//!
//! The `Dispatcher` owns the registry of connected display clients and fans
//! every patch out to all of them.
//!
//! ## Core Design Principles:
//!
//! 1.  **Serialize once**: a patch is rendered to JSON a single time and the
//!     resulting `Frame` is shared between clients through an `Arc`.
//!
//! 2.  **Isolated delivery**: every client owns a bounded MPSC channel drained
//!     by its own socket task. The hub never writes to a socket itself; it only
//!     queues frames, concurrently, each with its own `send_timeout`. A client
//!     whose queue stays full for longer than that, or whose receiver is gone,
//!     is unregistered. Nothing is propagated to the caller and no other client
//!     waits on it.
//!
//! 3.  **Consistent joins**: a newly registered client is primed with a welcome
//!     frame (the full last-broadcast state plus the upstream data sources).
//!     Registration and the welcome update of a broadcast happen under the same
//!     lock, so a client joining during a broadcast either gets the old welcome
//!     followed by the patch, or the new welcome alone.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::core::diff::{DataSources, Patch};
use crate::core::snapshot::RoundSnapshot;

/// Identifier handed out by `Dispatcher::register`.
pub type ClientId = u64;

/// A serialized message queued to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number of the snapshot this frame brings the client to.
    pub seq: u64,
    /// Sparse JSON object.
    pub payload: String,
}

/// Why a frame could not be queued to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientSendError {
    /// The client's socket task has gone away.
    #[error("client channel closed")]
    Closed,
    /// The client's queue stayed full for the whole send timeout.
    #[error("client did not accept the frame within {0:?}")]
    Timeout(Duration),
}

/// Tuning knobs of the hub.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Frames a client may have queued before it counts as slow.
    pub client_buffer: usize,
    /// How long a single queue attempt may wait for room.
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            client_buffer: 16,
            send_timeout: Duration::from_millis(250),
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the frame was queued to.
    pub delivered: usize,
    /// Clients removed because their send failed or timed out.
    pub dropped: usize,
}

/// Registry entry of one connected client.
struct ClientHandle {
    /// Remote address, for logs.
    peer: String,
    sender: mpsc::Sender<Arc<Frame>>,
    /// Sequence number of the last frame queued to this client.
    last_seq: u64,
}

struct Registry {
    clients: HashMap<ClientId, ClientHandle>,
    /// Full state of the last broadcast snapshot, sent to new clients.
    welcome: Arc<Frame>,
}

/// The central fan-out point between the poll loop and the client sockets.
pub struct Dispatcher {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    data_sources: DataSources,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Creates an empty hub. `data_sources` is advertised in every welcome.
    pub fn new(data_sources: DataSources, config: DispatcherConfig) -> Self {
        let welcome = Patch::default().with_data_sources(data_sources.clone());
        let payload = welcome.to_json().unwrap_or_else(|_| String::from("{}"));
        Self {
            registry: Mutex::new(Registry {
                clients: HashMap::new(),
                welcome: Arc::new(Frame { seq: 0, payload }),
            }),
            next_id: AtomicU64::new(1),
            data_sources,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a client and returns the receiver its socket task drains.
    ///
    /// The receiver already holds the welcome frame.
    pub fn register(&self, peer: &str) -> (ClientId, mpsc::Receiver<Arc<Frame>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.client_buffer.max(1));

        let mut registry = self.lock();
        let welcome = Arc::clone(&registry.welcome);
        let last_seq = welcome.seq;
        // A fresh channel always has room for one frame.
        let _ = tx.try_send(welcome);
        registry.clients.insert(
            id,
            ClientHandle {
                peer: peer.to_string(),
                sender: tx,
                last_seq,
            },
        );
        let connected = registry.clients.len();
        drop(registry);

        tracing::info!(client_id = id, peer, connected, "client registered");
        (id, rx)
    }

    /// Removes a client. Returns `false` when it was already gone.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut registry = self.lock();
        let removed = registry.clients.remove(&id);
        let connected = registry.clients.len();
        drop(registry);

        match removed {
            Some(handle) => {
                tracing::info!(client_id = id, peer = %handle.peer, connected, "client unregistered");
                true
            }
            None => false,
        }
    }

    /// Queues `patch` to every registered client and makes `snapshot` the
    /// welcome state for clients that join afterwards.
    ///
    /// An empty patch is ignored. Clients that cannot take the frame within
    /// the send timeout are dropped; this never fails.
    pub async fn broadcast(&self, seq: u64, patch: &Patch, snapshot: &RoundSnapshot) -> BroadcastReport {
        if patch.is_empty() {
            tracing::debug!(seq, "empty patch, nothing to broadcast");
            return BroadcastReport::default();
        }

        let (payload, welcome) = match (
            patch.to_json(),
            Patch::full(snapshot)
                .with_data_sources(self.data_sources.clone())
                .to_json(),
        ) {
            (Ok(payload), Ok(welcome)) => (payload, welcome),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(seq, error = %e, "failed to serialize patch");
                return BroadcastReport::default();
            }
        };
        let frame = Arc::new(Frame { seq, payload });

        let targets: Vec<(ClientId, mpsc::Sender<Arc<Frame>>)> = {
            let mut registry = self.lock();
            registry.welcome = Arc::new(Frame { seq, payload: welcome });
            registry
                .clients
                .iter()
                .map(|(id, handle)| (*id, handle.sender.clone()))
                .collect()
        };

        let timeout = self.config.send_timeout;
        let results = join_all(targets.into_iter().map(|(id, sender)| {
            let frame = Arc::clone(&frame);
            async move {
                let result = sender.send_timeout(frame, timeout).await.map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => ClientSendError::Timeout(timeout),
                    SendTimeoutError::Closed(_) => ClientSendError::Closed,
                });
                (id, result)
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut registry = self.lock();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    if let Some(handle) = registry.clients.get_mut(&id) {
                        handle.last_seq = seq;
                    }
                }
                Err(e) => {
                    report.dropped += 1;
                    if let Some(handle) = registry.clients.remove(&id) {
                        tracing::warn!(client_id = id, peer = %handle.peer, error = %e, "dropping client");
                    }
                }
            }
        }
        drop(registry);

        tracing::debug!(seq, delivered = report.delivered, dropped = report.dropped, "patch broadcast");
        report
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Sequence number of the last frame queued to `id`.
    pub fn last_seq(&self, id: ClientId) -> Option<u64> {
        self.lock().clients.get(&id).map(|handle| handle.last_seq)
    }

    /// Drops every client sender so that socket tasks wind down.
    pub fn close_all(&self) {
        let mut registry = self.lock();
        let closed = registry.clients.len();
        registry.clients.clear();
        drop(registry);
        tracing::info!(closed, "all client connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::{ParticipationMetric, ValidatorInfo};

    fn sources() -> DataSources {
        DataSources {
            api: "http://api".into(),
            rpc: "http://rpc".into(),
        }
    }

    fn snapshot(height: u64) -> RoundSnapshot {
        let roster: Vec<ValidatorInfo> = vec![ValidatorInfo {
            index: 0,
            address: "AAAAAAAAAAAA".into(),
            moniker: "alpha".into(),
            voting_power: 1,
        }];
        RoundSnapshot {
            height,
            round: 0,
            version: "v1".into(),
            roster: roster.into(),
            prevotes: vec![true],
            precommits: vec![false],
            prevote_percentage: 100,
            precommit_percentage: 0,
            prevote_power: 1,
            precommit_power: 0,
            metric: ParticipationMetric::VotingPower,
        }
    }

    fn height_patch(height: u64) -> Patch {
        Patch {
            height: Some(height),
            ..Patch::default()
        }
    }

    #[tokio::test]
    async fn delivers_same_frame_to_every_client_despite_disconnect() {
        let hub = Dispatcher::new(sources(), DispatcherConfig::default());
        let (_a, mut rx_a) = hub.register("a");
        let (_b, rx_b) = hub.register("b");
        let (_c, mut rx_c) = hub.register("c");

        // Welcome frames.
        for rx in [&mut rx_a, &mut rx_c] {
            let welcome = rx.recv().await.unwrap();
            assert_eq!(welcome.seq, 0);
            assert!(welcome.payload.contains("data_sources"));
        }

        // Client b goes away before the broadcast completes.
        drop(rx_b);

        let report = hub.broadcast(1, &height_patch(10), &snapshot(10)).await;
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 1 });
        assert_eq!(hub.client_count(), 2);

        for rx in [&mut rx_a, &mut rx_c] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.seq, 1);
            assert_eq!(frame.payload, r#"{"height":10}"#);
        }
    }

    #[tokio::test]
    async fn empty_patch_is_never_sent() {
        let hub = Dispatcher::new(sources(), DispatcherConfig::default());
        let (id, mut rx) = hub.register("a");
        rx.recv().await.unwrap();

        let report = hub.broadcast(1, &Patch::default(), &snapshot(10)).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.last_seq(id), Some(0));

        // The welcome state was not advanced either.
        let (_late, mut late_rx) = hub.register("late");
        assert_eq!(late_rx.recv().await.unwrap().seq, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_client_is_dropped_without_delaying_others() {
        let config = DispatcherConfig {
            client_buffer: 1,
            send_timeout: Duration::from_millis(50),
        };
        let hub = Dispatcher::new(sources(), config);
        let (fast, mut fast_rx) = hub.register("fast");
        let (slow, _slow_rx) = hub.register("slow");

        // The fast client drains its welcome, the slow one never reads.
        fast_rx.recv().await.unwrap();

        let report = hub.broadcast(7, &height_patch(3), &snapshot(3)).await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert_eq!(hub.last_seq(fast), Some(7));
        assert_eq!(hub.last_seq(slow), None);
        assert_eq!(fast_rx.recv().await.unwrap().payload, r#"{"height":3}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn join_and_leave_while_broadcast_is_parked() {
        let config = DispatcherConfig {
            client_buffer: 1,
            send_timeout: Duration::from_millis(100),
        };
        let hub = Arc::new(Dispatcher::new(sources(), config));
        let (reader, mut reader_rx) = hub.register("reader");
        let (_stuck, _stuck_rx) = hub.register("stuck");
        let (_leaver, leaver_rx) = hub.register("leaver");
        reader_rx.recv().await.unwrap();

        let in_flight = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.broadcast(5, &height_patch(50), &snapshot(50)).await }
        });

        // The fan-out is now waiting on the two full queues.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!in_flight.is_finished());

        let (joiner, mut joiner_rx) = hub.register("joiner");
        drop(leaver_rx);

        let report = in_flight.await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 2 });
        assert_eq!(hub.client_count(), 2);

        // The joiner sees the new state once, never the patch on top of it.
        let welcome = joiner_rx.recv().await.unwrap();
        assert_eq!(welcome.seq, 5);
        let value: serde_json::Value = serde_json::from_str(&welcome.payload).unwrap();
        assert_eq!(value["height"], 50);
        assert_eq!(value["pv_list"], serde_json::json!([1]));
        assert_eq!(value["data_sources"]["api"], "http://api");
        assert!(joiner_rx.try_recv().is_err());
        assert_eq!(hub.last_seq(joiner), Some(5));

        assert_eq!(hub.last_seq(reader), Some(5));
        assert_eq!(reader_rx.recv().await.unwrap().payload, r#"{"height":50}"#);
    }

    #[tokio::test]
    async fn late_joiner_gets_full_state_welcome() {
        let hub = Dispatcher::new(sources(), DispatcherConfig::default());
        hub.broadcast(4, &height_patch(42), &snapshot(42)).await;

        let (id, mut rx) = hub.register("late");
        let welcome = rx.recv().await.unwrap();
        assert_eq!(welcome.seq, 4);
        assert_eq!(hub.last_seq(id), Some(4));

        let value: serde_json::Value = serde_json::from_str(&welcome.payload).unwrap();
        assert_eq!(value["height"], 42);
        assert_eq!(value["monikers"], serde_json::json!(["alpha"]));
        assert_eq!(value["pv_list"], serde_json::json!([1]));
        assert_eq!(value["data_sources"]["rpc"], "http://rpc");
    }

    #[tokio::test]
    async fn unregister_and_close_all() {
        let hub = Dispatcher::new(sources(), DispatcherConfig::default());
        let (a, _rx_a) = hub.register("a");
        let (_b, mut rx_b) = hub.register("b");

        assert!(hub.unregister(a));
        assert!(!hub.unregister(a));
        assert_eq!(hub.client_count(), 1);

        hub.close_all();
        assert_eq!(hub.client_count(), 0);
        rx_b.recv().await.unwrap(); // welcome
        assert!(rx_b.recv().await.is_none());
    }
}

//! Transport metrics collection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct PtlMetricsSnapshot {
    /// Messages sent eagerly.
    pub eager_sends: u64,
    /// Messages sent through rendezvous.
    pub rndv_sends: u64,
    /// Rendezvous sends that fell back to eager fragments after a
    /// registration failure.
    pub copy_fallbacks: u64,
    /// RDMA writes issued.
    pub puts_issued: u64,
    /// FIN fragments sent.
    pub fins_sent: u64,
    /// Payload bytes handed to the wire (eager and RDMA write).
    pub bytes_sent: u64,
    /// Payload bytes delivered into matched receive buffers.
    pub bytes_received: u64,
    /// Send requests completed successfully.
    pub requests_completed: u64,
    /// Send requests completed with an error. Inbound messages dropped
    /// with their peer are not counted.
    pub requests_failed: u64,
    /// Times a send hit an unavailable descriptor or full send queue.
    pub backpressure_events: u64,
    /// Completions naming a free or stale descriptor.
    pub stale_completions: u64,
    /// Fragments discarded as duplicates or unexpected.
    pub discarded_fragments: u64,
    /// Connections established.
    pub connections_established: u64,
    /// Peers moved to the failed state.
    pub peers_failed: u64,
    /// Currently connected peers.
    pub connected_peers: u32,
}

/// Thread-safe transport metrics collector.
pub struct PtlMetrics {
    eager_sends: AtomicU64,
    rndv_sends: AtomicU64,
    copy_fallbacks: AtomicU64,
    puts_issued: AtomicU64,
    fins_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    backpressure_events: AtomicU64,
    stale_completions: AtomicU64,
    discarded_fragments: AtomicU64,
    connections_established: AtomicU64,
    peers_failed: AtomicU64,
    connected_peers: AtomicU32,
}

impl Default for PtlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PtlMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtlMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl PtlMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            eager_sends: AtomicU64::new(0),
            rndv_sends: AtomicU64::new(0),
            copy_fallbacks: AtomicU64::new(0),
            puts_issued: AtomicU64::new(0),
            fins_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            stale_completions: AtomicU64::new(0),
            discarded_fragments: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            peers_failed: AtomicU64::new(0),
            connected_peers: AtomicU32::new(0),
        }
    }

    /// Counts an eager send.
    pub fn inc_eager_sends(&self) {
        self.eager_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a rendezvous send.
    pub fn inc_rndv_sends(&self) {
        self.rndv_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a copy fallback.
    pub fn inc_copy_fallbacks(&self) {
        self.copy_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an issued RDMA write.
    pub fn inc_puts_issued(&self) {
        self.puts_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a FIN.
    pub fn inc_fins_sent(&self) {
        self.fins_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts a successfully completed send request.
    pub fn inc_requests_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an operation completed with an error.
    pub fn inc_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a backpressure event.
    pub fn inc_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a stale completion.
    pub fn inc_stale_completions(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a discarded fragment.
    pub fn inc_discarded_fragments(&self) {
        self.discarded_fragments.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a newly connected peer.
    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected_peers.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connected peer going away.
    pub fn connection_lost(&self) {
        let _ = self
            .connected_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Counts a failed peer.
    pub fn inc_peers_failed(&self) {
        self.peers_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of every counter.
    pub fn snapshot(&self) -> PtlMetricsSnapshot {
        PtlMetricsSnapshot {
            eager_sends: self.eager_sends.load(Ordering::Relaxed),
            rndv_sends: self.rndv_sends.load(Ordering::Relaxed),
            copy_fallbacks: self.copy_fallbacks.load(Ordering::Relaxed),
            puts_issued: self.puts_issued.load(Ordering::Relaxed),
            fins_sent: self.fins_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            discarded_fragments: self.discarded_fragments.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            peers_failed: self.peers_failed.load(Ordering::Relaxed),
            connected_peers: self.connected_peers.load(Ordering::Relaxed),
        }
    }
}

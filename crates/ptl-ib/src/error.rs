//! Error types for the RDMA transport.

use thiserror::Error;

use crate::config::ConfigError;
use crate::free_list::FreeListError;
use crate::header::HeaderError;
use crate::peer::ProcName;
use crate::verbs::{EndpointAddr, QpNum};

/// Result type alias for transport operations.
pub type PtlResult<T> = Result<T, PtlError>;

/// Result type alias for device (verbs) operations.
pub type VerbsResult<T> = Result<T, VerbsError>;

/// Errors reported by an RDMA device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerbsError {
    /// The device ran out of a hardware resource (pinned memory, keys, QPs).
    #[error("device resource exhausted: {resource}")]
    ResourceExhausted {
        /// The exhausted resource.
        resource: &'static str,
    },

    /// The send queue of a queue pair is full.
    #[error("send queue full on qp {0}")]
    QueueFull(QpNum),

    /// The queue pair does not exist on this device.
    #[error("unknown queue pair {0}")]
    InvalidQp(QpNum),

    /// The queue pair is not in a state that allows the operation.
    #[error("queue pair {qp} in state {state}")]
    InvalidQpState {
        /// The queue pair.
        qp: QpNum,
        /// Current state name.
        state: &'static str,
    },

    /// A local or remote memory key is unknown.
    #[error("unknown memory key 0x{0:08x}")]
    InvalidKey(u32),

    /// The address range is outside the registered region.
    #[error("access outside registered region: addr 0x{addr:x} len {len}")]
    AccessViolation {
        /// Start address of the access.
        addr: u64,
        /// Length of the access.
        len: u64,
    },

    /// The remote endpoint cannot be reached.
    #[error("endpoint {0} unreachable")]
    Unreachable(EndpointAddr),

    /// The device port is down.
    #[error("port down on {device}")]
    PortDown {
        /// Device name.
        device: String,
    },
}

/// Errors surfaced by the transport to the messaging layer.
#[derive(Debug, Clone, Error)]
pub enum PtlError {
    /// No descriptor or queue slot available; retry on a later progress cycle.
    #[error("backpressure: {resource} unavailable")]
    Backpressure {
        /// The resource that ran out.
        resource: &'static str,
    },

    /// Memory registration failed.
    #[error("memory registration failed: {0}")]
    RegistrationFailed(VerbsError),

    /// The connection to a peer was lost while work was outstanding.
    #[error("connection to {peer} lost")]
    ConnectionLost {
        /// The affected peer.
        peer: ProcName,
    },

    /// The peer already failed; no new work is accepted for it.
    #[error("peer {peer} has failed")]
    PeerFailed {
        /// The failed peer.
        peer: ProcName,
    },

    /// The peer is closed or was never announced through `add_procs`.
    #[error("unknown peer {peer}")]
    UnknownPeer {
        /// The requested peer.
        peer: ProcName,
    },

    /// The request handle does not name a live send request.
    #[error("unknown request {0}")]
    UnknownRequest(u64),

    /// The inbound handle does not name a live inbound message.
    #[error("unknown inbound message {0}")]
    UnknownInbound(u64),

    /// The request already has fragments on the wire and cannot be aborted.
    #[error("request {0} has fragments in flight")]
    RequestInFlight(u64),

    /// The operation does not fit the current request or message state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A wire header could not be decoded.
    #[error("invalid header: {0}")]
    InvalidHeader(#[from] HeaderError),

    /// A descriptor free list rejected an operation.
    #[error("free list error: {0}")]
    FreeList(#[from] FreeListError),

    /// The device reported an error.
    #[error("device error: {0}")]
    Verbs(#[from] VerbsError),

    /// No usable interface was found at initialization.
    #[error("no usable RDMA interface")]
    NoUsableInterface,

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The transport was disabled through `control`.
    #[error("transport disabled")]
    Disabled,
}

impl PtlError {
    /// Returns true for resource-exhaustion errors the caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PtlError::Backpressure { .. } | PtlError::RegistrationFailed(_)
        )
    }

    /// Returns true if the error is scoped to a single peer.
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            PtlError::ConnectionLost { .. } | PtlError::PeerFailed { .. }
        )
    }
}

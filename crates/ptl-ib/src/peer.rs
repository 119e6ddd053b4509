//! Remote process identities and per-peer connection state.
//!
//! A [`Peer`] tracks one remote process reachable through one module: its
//! queue pair, the connection state machine, the FIFO of work that may not
//! go to the wire yet, and the fragments currently on the wire.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::free_list::DescriptorId;
use crate::header::{FinHeader, RemoteHandle};
use crate::request::{InboundId, RequestId};
use crate::verbs::{EndpointAddr, QpNum};

/// Name of a remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcName {
    /// Job the process belongs to.
    pub jobid: u32,
    /// Rank of the process within its job.
    pub vpid: u32,
}

impl ProcName {
    /// Creates a process name.
    pub fn new(jobid: u32, vpid: u32) -> Self {
        Self { jobid, vpid }
    }
}

impl fmt::Display for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.jobid, self.vpid)
    }
}

/// A remote process as announced by the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    /// Process name.
    pub name: ProcName,
    /// Fabric addresses of the process's interfaces.
    pub endpoints: Vec<EndpointAddr>,
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// No connection yet.
    Idle,
    /// Queue pair created, waiting for the remote side.
    Connecting,
    /// Fragments may be issued.
    Connected,
    /// The connection broke; no new work is accepted.
    Failed,
    /// Torn down on request.
    Closed,
}

impl PeerState {
    /// Returns true if moving from `self` to `to` is a legal transition.
    pub fn can_transition(self, to: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Idle, Connected)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Failed)
                | (_, Closed)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Idle => "idle",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One unit of wire work for a peer, issued in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    /// Inline data fragment of a request; `offset` is relative to the
    /// message start.
    Eager {
        req: RequestId,
        seq: u32,
        offset: usize,
        len: usize,
    },
    /// Rendezvous start advertising the request's source region.
    RndvStart { req: RequestId, seq: u32 },
    /// RDMA write of `len` message bytes at `offset`.
    Put {
        req: RequestId,
        seq: u32,
        offset: usize,
        len: usize,
    },
    /// Sender notice that every write landed.
    Fin { req: RequestId, seq: u32 },
    /// Receiver answer advertising the destination region.
    Ack {
        inbound: InboundId,
        src_req: u64,
        handle: RemoteHandle,
    },
    /// Receiver notice that the destination region was released.
    FinAck { src_req: u64, fin: FinHeader },
}

impl WorkItem {
    /// The send request the item belongs to, if any.
    pub(crate) fn request(&self) -> Option<RequestId> {
        match *self {
            WorkItem::Eager { req, .. }
            | WorkItem::RndvStart { req, .. }
            | WorkItem::Put { req, .. }
            | WorkItem::Fin { req, .. } => Some(req),
            WorkItem::Ack { .. } | WorkItem::FinAck { .. } => None,
        }
    }
}

/// Per-peer connection state.
#[derive(Debug)]
pub(crate) struct Peer {
    pub(crate) name: ProcName,
    pub(crate) module: usize,
    pub(crate) remote: EndpointAddr,
    pub(crate) state: PeerState,
    pub(crate) qp: Option<QpNum>,
    pub(crate) pending: VecDeque<WorkItem>,
    pub(crate) in_flight: HashSet<DescriptorId>,
    pub(crate) posted_recvs: HashSet<DescriptorId>,
}

impl Peer {
    pub(crate) fn new(name: ProcName, module: usize, remote: EndpointAddr) -> Self {
        Self {
            name,
            module,
            remote,
            state: PeerState::Idle,
            qp: None,
            pending: VecDeque::new(),
            in_flight: HashSet::new(),
            posted_recvs: HashSet::new(),
        }
    }

    /// Moves to `to`; illegal transitions are logged and ignored.
    pub(crate) fn transition(&mut self, to: PeerState) -> bool {
        if self.state == to {
            return true;
        }
        if !self.state.can_transition(to) {
            warn!(peer = %self.name, from = %self.state, to = %to, "illegal peer transition");
            return false;
        }
        debug!(peer = %self.name, from = %self.state, to = %to, "peer state");
        self.state = to;
        true
    }

    /// Returns true if work is queued or on the wire.
    pub(crate) fn has_outstanding_work(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// Returns true if the peer still accepts new work.
    pub(crate) fn accepts_work(&self) -> bool {
        matches!(
            self.state,
            PeerState::Idle | PeerState::Connecting | PeerState::Connected
        )
    }
}

//! Device interface consumed by the transport.
//!
//! [`Verbs`] is the seam between the fragment engine and one RDMA interface
//! (device + port). Everything is non-blocking: posts either succeed or fail
//! immediately, and results come back through [`Verbs::poll_cq`] and
//! [`Verbs::poll_async_event`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VerbsResult;
use crate::memory::HostBuffer;

/// Queue pair number, unique per device.
pub type QpNum = u32;

/// Fabric address of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointAddr {
    /// Subnet the interface is attached to; only equal subnets reach each other.
    pub subnet: u64,
    /// Local identifier of the interface within the subnet.
    pub lid: u32,
    /// Port number on the device.
    pub port: u8,
}

impl EndpointAddr {
    /// Creates an endpoint address.
    pub fn new(subnet: u64, lid: u32, port: u8) -> Self {
        Self { subnet, lid, port }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}:{}", self.subnet, self.lid, self.port)
    }
}

/// Memory access rights requested at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local reads (send source, RDMA write source).
    pub const LOCAL_READ: Self = Self(1);
    /// Local writes (receive target).
    pub const LOCAL_WRITE: Self = Self(2);
    /// Remote reads.
    pub const REMOTE_READ: Self = Self(4);
    /// Remote writes (RDMA write target).
    pub const REMOTE_WRITE: Self = Self(8);
    /// All of the above.
    pub const ALL: Self = Self(0xF);

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No access.
    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Keys returned by a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MrKeys {
    /// Local key, used in scatter/gather entries of local work requests.
    pub lkey: u32,
    /// Remote key, advertised to peers for RDMA access.
    pub rkey: u32,
}

/// Queue pair state, following the reliable-connected state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QpState {
    /// Freshly created.
    #[default]
    Reset,
    /// Receives may be posted, not yet connected.
    Init,
    /// Connected and able to receive.
    ReadyToReceive,
    /// Connected and able to send.
    ReadyToSend,
    /// Fatal error; all posts fail.
    Error,
}

impl QpState {
    /// Short state name for errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            QpState::Reset => "reset",
            QpState::Init => "init",
            QpState::ReadyToReceive => "rtr",
            QpState::ReadyToSend => "rts",
            QpState::Error => "error",
        }
    }
}

/// Work request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    /// Two-sided send, consumes a posted receive at the peer.
    Send,
    /// Receive completion.
    Recv,
    /// One-sided write into a remote registered region.
    RdmaWrite,
}

/// Completion status of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompletionStatus {
    /// The operation completed.
    #[default]
    Success,
    /// Local protection or length error.
    LocalError,
    /// The remote side rejected the operation.
    RemoteError,
    /// Flushed because the queue pair entered the error state.
    Flushed,
}

/// Scatter/gather entry naming registered local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
    /// Local key of the region containing the range.
    pub lkey: u32,
}

/// Remote side of an RDMA write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSge {
    /// Remote start address.
    pub addr: u64,
    /// Remote key of the target region.
    pub rkey: u32,
}

/// A send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    /// Caller cookie returned in the completion.
    pub wr_id: u64,
    /// `Send` or `RdmaWrite`.
    pub opcode: WrOpcode,
    /// Local source.
    pub local: Sge,
    /// Remote target, required for `RdmaWrite`.
    pub remote: Option<RemoteSge>,
}

/// A receive-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    /// Caller cookie returned in the completion.
    pub wr_id: u64,
    /// Local landing area.
    pub local: Sge,
}

/// An entry drained from the completion queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Cookie of the completed work request.
    pub wr_id: u64,
    /// Outcome.
    pub status: CompletionStatus,
    /// Operation that completed.
    pub opcode: WrOpcode,
    /// Bytes transferred (receive: bytes landed).
    pub byte_len: u32,
    /// Queue pair the work request was posted on.
    pub qp_num: QpNum,
}

/// Events from the asynchronous channel of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncEvent {
    /// A remote endpoint asks to connect; `qp` was created for it.
    ConnectRequest {
        /// Passive queue pair created on this device.
        qp: QpNum,
        /// Address of the requesting interface.
        remote: EndpointAddr,
    },
    /// An outgoing connection attempt was accepted.
    Established {
        /// The active queue pair.
        qp: QpNum,
    },
    /// The remote side tore the connection down.
    Disconnected {
        /// The local queue pair of the connection.
        qp: QpNum,
    },
    /// The queue pair hit a fatal error.
    QpFatal {
        /// The failed queue pair.
        qp: QpNum,
    },
    /// The port went down; every queue pair on it is lost.
    PortError,
}

/// One RDMA interface.
pub trait Verbs: Send + Sync {
    /// Device name, e.g. "mlx5_0".
    fn device_name(&self) -> &str;

    /// Fabric address of this interface.
    fn local_addr(&self) -> EndpointAddr;

    /// Whether the port is up.
    fn port_active(&self) -> bool;

    /// Pins `[offset, offset + len)` of `buf` and returns its keys.
    fn reg_mr(
        &self,
        buf: &HostBuffer,
        offset: usize,
        len: usize,
        access: AccessFlags,
    ) -> VerbsResult<MrKeys>;

    /// Unpins the region named by `lkey`.
    fn dereg_mr(&self, lkey: u32) -> VerbsResult<()>;

    /// Creates a queue pair in the `Init` state.
    fn create_qp(&self) -> VerbsResult<QpNum>;

    /// Starts connecting `qp` to `remote`; completion is reported as
    /// [`AsyncEvent::Established`].
    fn connect(&self, qp: QpNum, remote: EndpointAddr) -> VerbsResult<()>;

    /// Accepts the connection request that created `qp`.
    fn accept(&self, qp: QpNum) -> VerbsResult<()>;

    /// Destroys `qp`, rejecting it if it was never accepted.
    fn destroy_qp(&self, qp: QpNum) -> VerbsResult<()>;

    /// Posts a send-queue work request.
    fn post_send(&self, qp: QpNum, wr: SendWr) -> VerbsResult<()>;

    /// Posts a receive-queue work request.
    fn post_recv(&self, qp: QpNum, wr: RecvWr) -> VerbsResult<()>;

    /// Drains up to `max` completions.
    fn poll_cq(&self, max: usize) -> Vec<WorkCompletion>;

    /// Takes the next asynchronous event, if any.
    fn poll_async_event(&self) -> Option<AsyncEvent>;
}

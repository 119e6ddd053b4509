//! Request and fragment descriptors, completion handles and events.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::{PtlError, PtlResult};
use crate::free_list::{DescriptorId, Reset};
use crate::header::{FragKind, RemoteHandle};
use crate::memory::HostBuffer;
use crate::peer::ProcName;
use crate::registry::RegionHandle;
use crate::verbs::QpNum;

/// Handle of a send request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub(crate) DescriptorId);

impl RequestId {
    /// Wire cookie carried in `src_req`.
    pub fn cookie(self) -> u64 {
        self.0.to_wr_id()
    }

    pub(crate) fn from_cookie(cookie: u64) -> Self {
        Self(DescriptorId::from_wr_id(cookie))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Handle of an inbound message awaiting or undergoing delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InboundId(pub(crate) u64);

impl InboundId {
    /// Raw value, carried in `dst_req`.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InboundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in{}", self.0)
    }
}

/// Delivery strategy chosen for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    /// Copied into a pre-registered buffer, one fragment.
    Eager,
    /// Handle exchange followed by RDMA writes.
    Rendezvous,
    /// Copied in eager-sized fragments because memory could not be
    /// registered on one side.
    CopyFallback,
}

/// Messaging-layer flags for `send`. The low seven bits travel to the peer
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SendFlags(u8);

impl SendFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Do not issue RDMA writes when the receiver acknowledges a rendezvous;
    /// the caller drives them with `put` after a [`PtlEvent::Acked`].
    pub const DEFER_PUT: Self = Self(0x80);

    /// Flags from raw bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for SendFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Immediate result of `send` and `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendStatus {
    /// Every fragment went to the wire.
    Issued,
    /// The peer is not connected yet; fragments wait on its queue.
    Queued,
    /// Some fragments wait for descriptors or send-queue slots; `progress`
    /// retries them.
    Backpressure,
}

/// Final result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    /// The request.
    pub request: RequestId,
    /// Destination process.
    pub peer: ProcName,
    /// Message bytes delivered.
    pub bytes: usize,
    /// Strategy used.
    pub protocol: Protocol,
    /// Fragments issued, including control fragments.
    pub fragments: u32,
}

/// Final result of a successful receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecvOutcome {
    /// The inbound message.
    pub inbound: InboundId,
    /// Source process.
    pub peer: ProcName,
    /// Message bytes placed in the destination buffer.
    pub bytes: usize,
    /// Opaque match information from the sender.
    pub match_bits: u64,
}

/// Notifications for the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtlEvent {
    /// The first fragment of a new message arrived; answer with `matched`.
    Arrived {
        /// Handle for `matched`.
        inbound: InboundId,
        /// Source process.
        peer: ProcName,
        /// Opaque match information.
        match_bits: u64,
        /// Total message length.
        msg_len: u64,
        /// Flags passed by the sender.
        flags: u8,
    },
    /// The receiver acknowledged a rendezvous sent with
    /// [`SendFlags::DEFER_PUT`]; drive the data with `put`.
    Acked {
        /// The request.
        request: RequestId,
        /// Destination process.
        peer: ProcName,
    },
    /// The connection to a peer failed.
    PeerFailed {
        /// The failed peer.
        peer: ProcName,
    },
}

/// One-shot completion handle. Resolves exactly once, either as a future
/// or through [`Completion::try_take`].
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<PtlResult<T>>,
    done: bool,
}

pub(crate) type Completer<T> = oneshot::Sender<PtlResult<T>>;

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx, done: false })
    }

    /// Takes the result if it is available. Returns `None` while the
    /// operation is running and after the result was taken.
    pub fn try_take(&mut self) -> Option<PtlResult<T>> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.done = true;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.done = true;
                Some(Err(abandoned()))
            }
        }
    }

    /// Returns true once the result was taken.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

fn abandoned() -> PtlError {
    PtlError::InvalidState("operation abandoned before completion".into())
}

impl<T> Future for Completion<T> {
    type Output = PtlResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(PtlError::InvalidState("completion already taken".into())));
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or_else(|_| Err(abandoned())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Lifecycle of a send request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RequestPhase {
    #[default]
    Initialized,
    Active,
    Done,
}

/// Send request descriptor.
#[derive(Debug, Default)]
pub(crate) struct SendRequest {
    pub(crate) buf: Option<HostBuffer>,
    pub(crate) len: usize,
    pub(crate) match_bits: u64,
    pub(crate) completer: Option<Completer<SendOutcome>>,
    pub(crate) phase: RequestPhase,
    pub(crate) peer: Option<ProcName>,
    /// Offset of the message within `buf`.
    pub(crate) base: usize,
    pub(crate) size: usize,
    pub(crate) flags: SendFlags,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) next_seq: u32,
    /// Fragments queued or on the wire.
    pub(crate) outstanding: usize,
    pub(crate) issued: u32,
    /// Every data fragment has been queued.
    pub(crate) data_scheduled: bool,
    pub(crate) source: Option<(usize, RegionHandle)>,
    pub(crate) remote: Option<RemoteHandle>,
    pub(crate) dst_req: u64,
    pub(crate) put_cursor: usize,
    pub(crate) puts_outstanding: usize,
    pub(crate) fin_queued: bool,
    pub(crate) fin_acked: bool,
}

impl SendRequest {
    pub(crate) fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Returns true if the request finished every step of its protocol.
    pub(crate) fn is_complete(&self) -> bool {
        if self.phase != RequestPhase::Active || self.outstanding > 0 {
            return false;
        }
        match self.protocol {
            Some(Protocol::Eager) | Some(Protocol::CopyFallback) => self.data_scheduled,
            Some(Protocol::Rendezvous) => self.fin_acked,
            None => false,
        }
    }
}

impl Reset for SendRequest {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Who a send fragment works for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FragOwner {
    #[default]
    None,
    Request(RequestId),
    Control,
}

/// Send fragment descriptor: one posted send-queue work request.
#[derive(Debug, Default)]
pub(crate) struct SendFrag {
    pub(crate) owner: FragOwner,
    pub(crate) peer: Option<ProcName>,
    pub(crate) module: usize,
    pub(crate) qp: QpNum,
    pub(crate) kind: Option<FragKind>,
    pub(crate) is_put: bool,
    pub(crate) seq: u32,
    pub(crate) bytes: usize,
    pub(crate) send_buf: Option<DescriptorId>,
}

impl Reset for SendFrag {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Pre-registered buffer a control or eager fragment is assembled in.
#[derive(Debug)]
pub(crate) struct SendBuffer {
    pub(crate) buf: HostBuffer,
    pub(crate) region: Option<RegionHandle>,
    pub(crate) used: usize,
}

impl SendBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: HostBuffer::zeroed(capacity),
            region: None,
            used: 0,
        }
    }
}

impl Reset for SendBuffer {
    fn reset(&mut self) {
        self.used = 0;
    }
}

/// Receive fragment descriptor: a landing buffer registered lazily on each
/// module it is posted to.
#[derive(Debug)]
pub(crate) struct RecvFrag {
    pub(crate) buf: HostBuffer,
    pub(crate) regions: Vec<Option<RegionHandle>>,
    pub(crate) posted: Option<(usize, QpNum)>,
}

impl RecvFrag {
    pub(crate) fn new(capacity: usize, modules: usize) -> Self {
        Self {
            buf: HostBuffer::zeroed(capacity),
            regions: vec![None; modules],
            posted: None,
        }
    }
}

impl Reset for RecvFrag {
    fn reset(&mut self) {
        self.posted = None;
    }
}

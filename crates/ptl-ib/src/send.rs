//! Send side of the fragment engine.
//!
//! `send` picks the protocol and turns a request into [`WorkItem`]s on the
//! peer's FIFO queue; `flush_peer` issues queued items in order while the
//! peer is connected and descriptors and send-queue slots are available.
//! An item that cannot be issued stays at the head of the queue, so
//! per-peer submission order is preserved across backpressure.

use tracing::{debug, trace, warn};

use crate::component::{ComponentState, Module, PtlComponent};
use crate::error::{PtlError, PtlResult, VerbsError};
use crate::free_list::DescriptorId;
use crate::header::{BaseHeader, FinHeader, FragHeader, FragKind, RemoteHandle};
use crate::memory::HostBuffer;
use crate::peer::{PeerState, ProcName, WorkItem};
use crate::request::{
    FragOwner, Protocol, RequestId, RequestPhase, SendFlags, SendOutcome, SendRequest, SendStatus,
};
use crate::verbs::{QpNum, RemoteSge, SendWr, Sge, WrOpcode};

/// Splits `total` bytes into `(offset, len)` chunks of at most `chunk`
/// bytes. An empty range still yields one empty chunk.
pub(crate) fn split(total: usize, chunk: usize) -> Vec<(usize, usize)> {
    if total == 0 {
        return vec![(0, 0)];
    }
    let chunk = chunk.max(1);
    (0..total)
        .step_by(chunk)
        .map(|off| (off, chunk.min(total - off)))
        .collect()
}

/// A Send-opcode fragment ready to be copied into a send buffer.
struct Outgoing {
    header: FragHeader,
    payload: Option<(HostBuffer, usize, usize)>,
    owner: FragOwner,
}

impl PtlComponent {
    /// Starts transferring `request`'s bytes `[offset, offset + size)` to
    /// `peer` as one message.
    ///
    /// Messages up to the eager limit are copied into a pre-registered
    /// buffer and sent as one fragment; larger ones go through rendezvous.
    /// The returned status says how far the fragments got; the request's
    /// completion reports the final outcome.
    pub fn send(
        &self,
        peer: ProcName,
        request: RequestId,
        offset: usize,
        size: usize,
        flags: SendFlags,
    ) -> PtlResult<SendStatus> {
        let mut st = self.inner.lock();
        st.start_send(peer, request, offset, size, flags)
    }

    /// Issues RDMA writes for message bytes `[offset, offset + size)` of an
    /// acknowledged rendezvous. Ranges must be put in order; the FIN goes
    /// out once the last byte has been written.
    pub fn put(
        &self,
        peer: ProcName,
        request: RequestId,
        offset: usize,
        size: usize,
        _flags: SendFlags,
    ) -> PtlResult<SendStatus> {
        let mut st = self.inner.lock();
        st.check_peer(peer)?;
        let req = st
            .requests
            .get(request.0)
            .ok_or(PtlError::UnknownRequest(request.cookie()))?;
        if req.phase != RequestPhase::Active
            || req.protocol != Some(Protocol::Rendezvous)
            || req.peer != Some(peer)
        {
            return Err(PtlError::InvalidState(format!(
                "{} is not an active rendezvous to {}",
                request, peer
            )));
        }
        if req.remote.is_none() {
            return Err(PtlError::InvalidState(format!(
                "{} not acknowledged by the receiver",
                request
            )));
        }
        let past_end = offset.checked_add(size).map_or(true, |end| end > req.size);
        if size == 0 || offset != req.put_cursor || past_end {
            return Err(PtlError::InvalidState(format!(
                "put [{}, {}) does not continue at {} within {} bytes",
                offset,
                offset.saturating_add(size),
                req.put_cursor,
                req.size
            )));
        }
        let items = st.schedule_puts(request, offset, size);
        st.enqueue(peer, items)
    }
}

impl ComponentState {
    pub(crate) fn start_send(
        &mut self,
        peer: ProcName,
        request: RequestId,
        offset: usize,
        size: usize,
        flags: SendFlags,
    ) -> PtlResult<SendStatus> {
        self.check_peer(peer)?;
        let module = self
            .peers
            .get(&peer)
            .map(|p| p.module)
            .ok_or(PtlError::UnknownPeer { peer })?;
        let eager_limit = self.config.eager_limit;

        let req = self
            .requests
            .get_mut(request.0)
            .ok_or(PtlError::UnknownRequest(request.cookie()))?;
        if req.phase != RequestPhase::Initialized {
            return Err(PtlError::RequestInFlight(request.cookie()));
        }
        let buf = match (&req.buf, offset.checked_add(size)) {
            (Some(buf), Some(end)) if end <= req.len => buf.clone(),
            _ => {
                return Err(PtlError::InvalidState(format!(
                    "range [{}, +{}) outside request of {} bytes",
                    offset, size, req.len
                )))
            }
        };
        req.phase = RequestPhase::Active;
        req.peer = Some(peer);
        req.base = offset;
        req.size = size;
        req.flags = flags;

        let items = if size <= eager_limit {
            req.protocol = Some(Protocol::Eager);
            req.data_scheduled = true;
            self.metrics.inc_eager_sends();
            vec![WorkItem::Eager {
                req: request,
                seq: req.next_seq(),
                offset: 0,
                len: size,
            }]
        } else {
            match self.modules[module].registry.register(&buf, offset, size) {
                Ok(region) => {
                    req.protocol = Some(Protocol::Rendezvous);
                    req.source = Some((module, region));
                    self.metrics.inc_rndv_sends();
                    vec![WorkItem::RndvStart {
                        req: request,
                        seq: req.next_seq(),
                    }]
                }
                Err(e) => {
                    debug!(request = %request, error = %e, "source registration failed, copying");
                    req.protocol = Some(Protocol::CopyFallback);
                    req.data_scheduled = true;
                    self.metrics.inc_copy_fallbacks();
                    split(size, eager_limit)
                        .into_iter()
                        .map(|(offset, len)| WorkItem::Eager {
                            req: request,
                            seq: req.next_seq(),
                            offset,
                            len,
                        })
                        .collect()
                }
            }
        };
        req.outstanding += items.len();
        trace!(request = %request, peer = %peer, size, fragments = items.len(), "send planned");
        self.enqueue(peer, items)
    }

    /// Plans RDMA writes for `[offset, offset + size)` of a rendezvous.
    pub(crate) fn schedule_puts(
        &mut self,
        request: RequestId,
        offset: usize,
        size: usize,
    ) -> Vec<WorkItem> {
        let max_put = self.config.max_put_size.min(u32::MAX as usize);
        let Some(req) = self.requests.get_mut(request.0) else {
            return Vec::new();
        };
        let items: Vec<WorkItem> = split(size, max_put)
            .into_iter()
            .map(|(off, len)| WorkItem::Put {
                req: request,
                seq: req.next_seq(),
                offset: offset + off,
                len,
            })
            .collect();
        req.put_cursor = offset + size;
        req.puts_outstanding += items.len();
        req.outstanding += items.len();
        items
    }

    /// Appends work to a peer's queue and pushes it as far as possible.
    pub(crate) fn enqueue(&mut self, name: ProcName, items: Vec<WorkItem>) -> PtlResult<SendStatus> {
        let state = {
            let peer = self
                .peers
                .get_mut(&name)
                .ok_or(PtlError::UnknownPeer { peer: name })?;
            peer.pending.extend(items);
            peer.state
        };
        match state {
            PeerState::Idle => {
                self.start_connect(name)?;
                Ok(SendStatus::Queued)
            }
            PeerState::Connecting => Ok(SendStatus::Queued),
            PeerState::Connected => self.flush_peer(name),
            PeerState::Failed => Err(PtlError::PeerFailed { peer: name }),
            PeerState::Closed => Err(PtlError::UnknownPeer { peer: name }),
        }
    }

    /// Issues queued work in FIFO order until the queue is empty or a
    /// resource runs out.
    pub(crate) fn flush_peer(&mut self, name: ProcName) -> PtlResult<SendStatus> {
        loop {
            let item = match self.peers.get(&name) {
                Some(p) if p.state == PeerState::Connected => match p.pending.front() {
                    Some(item) => *item,
                    None => return Ok(SendStatus::Issued),
                },
                Some(_) => return Ok(SendStatus::Queued),
                None => return Err(PtlError::UnknownPeer { peer: name }),
            };
            match self.issue(name, item) {
                Ok(()) => {
                    if let Some(p) = self.peers.get_mut(&name) {
                        p.pending.pop_front();
                    }
                }
                Err(e) if e.is_recoverable() => {
                    trace!(peer = %name, error = %e, "send parked");
                    self.metrics.inc_backpressure();
                    return Ok(SendStatus::Backpressure);
                }
                Err(e) => {
                    warn!(peer = %name, error = %e, "post failed");
                    self.fail_peer(name, "post failed");
                    return Err(PtlError::ConnectionLost { peer: name });
                }
            }
        }
    }

    /// Posts one work item on the peer's queue pair.
    fn issue(&mut self, name: ProcName, item: WorkItem) -> PtlResult<()> {
        let (module, qp) = match self.peers.get(&name) {
            Some(p) => (
                p.module,
                p.qp.ok_or_else(|| PtlError::InvalidState(format!("{} has no queue pair", name)))?,
            ),
            None => return Err(PtlError::UnknownPeer { peer: name }),
        };
        let frag_id = self.send_frags.allocate().ok_or(PtlError::Backpressure {
            resource: "send fragment",
        })?;
        let posted = match item {
            WorkItem::Put {
                req,
                seq,
                offset,
                len,
            } => self.post_put(module, qp, frag_id, req, seq, offset, len),
            _ => self
                .build_message(item)
                .and_then(|out| self.post_message(module, qp, frag_id, out)),
        };
        match posted {
            Ok(()) => {
                if let Some(frag) = self.send_frags.get_mut(frag_id) {
                    frag.peer = Some(name);
                }
                if let Some(p) = self.peers.get_mut(&name) {
                    p.in_flight.insert(frag_id);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(fe) = self.send_frags.release(frag_id) {
                    warn!(error = %fe, "send fragment release failed");
                }
                Err(e)
            }
        }
    }

    fn request_ref(&self, req: RequestId) -> PtlResult<&SendRequest> {
        self.requests
            .get(req.0)
            .ok_or(PtlError::UnknownRequest(req.cookie()))
    }

    fn build_message(&self, item: WorkItem) -> PtlResult<Outgoing> {
        let out = match item {
            WorkItem::Eager {
                req,
                seq,
                offset,
                len,
            } => {
                let r = self.request_ref(req)?;
                let buf = r.buf.clone().ok_or(PtlError::UnknownRequest(req.cookie()))?;
                Outgoing {
                    header: FragHeader::eager(BaseHeader {
                        flags: r.flags.bits(),
                        seq,
                        src_req: req.cookie(),
                        dst_req: r.dst_req,
                        match_bits: r.match_bits,
                        msg_len: r.size as u64,
                        frag_offset: offset as u64,
                        frag_len: len as u32,
                        ..BaseHeader::new(FragKind::Eager)
                    }),
                    payload: Some((buf, r.base + offset, len)),
                    owner: FragOwner::Request(req),
                }
            }
            WorkItem::RndvStart { req, seq } => {
                let r = self.request_ref(req)?;
                let (buf, (_, region)) = r
                    .buf
                    .clone()
                    .zip(r.source)
                    .ok_or_else(|| PtlError::InvalidState(format!("{} has no source region", req)))?;
                let handle = RemoteHandle {
                    addr: buf.addr_at(r.base),
                    size: r.size as u64,
                    rkey: region.rkey,
                };
                Outgoing {
                    header: FragHeader::with_handle(
                        BaseHeader {
                            flags: r.flags.bits(),
                            seq,
                            src_req: req.cookie(),
                            match_bits: r.match_bits,
                            msg_len: r.size as u64,
                            ..BaseHeader::new(FragKind::Rndv)
                        },
                        handle,
                    ),
                    payload: None,
                    owner: FragOwner::Request(req),
                }
            }
            WorkItem::Fin { req, seq } => {
                let r = self.request_ref(req)?;
                let remote = r
                    .remote
                    .ok_or_else(|| PtlError::InvalidState(format!("{} has no destination", req)))?;
                Outgoing {
                    header: FragHeader::with_fin(
                        BaseHeader {
                            seq,
                            src_req: req.cookie(),
                            dst_req: r.dst_req,
                            msg_len: r.size as u64,
                            ..BaseHeader::new(FragKind::Fin)
                        },
                        FinHeader {
                            mr_addr: remote.addr,
                            mr_size: remote.size,
                        },
                    ),
                    payload: None,
                    owner: FragOwner::Request(req),
                }
            }
            WorkItem::Ack {
                inbound,
                src_req,
                handle,
            } => Outgoing {
                header: FragHeader::with_handle(
                    BaseHeader {
                        src_req,
                        dst_req: inbound.get(),
                        msg_len: handle.size,
                        ..BaseHeader::new(FragKind::Ack)
                    },
                    handle,
                ),
                payload: None,
                owner: FragOwner::Control,
            },
            WorkItem::FinAck { src_req, fin } => Outgoing {
                header: FragHeader::with_fin(
                    BaseHeader {
                        src_req,
                        ..BaseHeader::new(FragKind::FinAck)
                    },
                    fin,
                ),
                payload: None,
                owner: FragOwner::Control,
            },
            WorkItem::Put { req, .. } => {
                return Err(PtlError::InvalidState(format!(
                    "{} put is not a message fragment",
                    req
                )))
            }
        };
        Ok(out)
    }

    fn post_message(
        &mut self,
        module: usize,
        qp: QpNum,
        frag_id: DescriptorId,
        out: Outgoing,
    ) -> PtlResult<()> {
        let m = &mut self.modules[module];
        let sb_id = m.send_bufs.allocate().ok_or(PtlError::Backpressure {
            resource: "send buffer",
        })?;
        let posted = stage(m, sb_id, frag_id, &out)
            .and_then(|wr| m.device.post_send(qp, wr).map_err(post_error));
        if let Err(e) = posted {
            if let Err(fe) = m.send_bufs.release(sb_id) {
                warn!(error = %fe, "send buffer release failed");
            }
            return Err(e);
        }

        let payload_len = out.payload.as_ref().map_or(0, |(_, _, len)| *len);
        let kind = out.header.kind();
        if let Some(frag) = self.send_frags.get_mut(frag_id) {
            frag.owner = out.owner;
            frag.module = module;
            frag.qp = qp;
            frag.kind = Some(kind);
            frag.seq = out.header.base.seq;
            frag.bytes = payload_len;
            frag.send_buf = Some(sb_id);
        }
        if let FragOwner::Request(req) = out.owner {
            if let Some(r) = self.requests.get_mut(req.0) {
                r.issued += 1;
            }
        }
        if kind == FragKind::Fin {
            self.metrics.inc_fins_sent();
        }
        self.metrics.add_bytes_sent(payload_len as u64);
        trace!(qp, kind = ?kind, bytes = payload_len, "fragment posted");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn post_put(
        &mut self,
        module: usize,
        qp: QpNum,
        frag_id: DescriptorId,
        request: RequestId,
        seq: u32,
        offset: usize,
        len: usize,
    ) -> PtlResult<()> {
        let req = self
            .requests
            .get_mut(request.0)
            .ok_or(PtlError::UnknownRequest(request.cookie()))?;
        let (buf, (_, region), remote) = match (&req.buf, req.source, req.remote) {
            (Some(buf), Some(source), Some(remote)) => (buf.clone(), source, remote),
            _ => {
                return Err(PtlError::InvalidState(format!(
                    "{} is not ready for puts",
                    request
                )))
            }
        };
        let wr = SendWr {
            wr_id: frag_id.to_wr_id(),
            opcode: WrOpcode::RdmaWrite,
            local: Sge {
                addr: buf.addr_at(req.base + offset),
                len: len as u32,
                lkey: region.lkey,
            },
            remote: Some(RemoteSge {
                addr: remote.addr + offset as u64,
                rkey: remote.rkey,
            }),
        };
        self.modules[module]
            .device
            .post_send(qp, wr)
            .map_err(post_error)?;
        req.issued += 1;
        if let Some(frag) = self.send_frags.get_mut(frag_id) {
            frag.owner = FragOwner::Request(request);
            frag.module = module;
            frag.qp = qp;
            frag.is_put = true;
            frag.seq = seq;
            frag.bytes = len;
        }
        self.metrics.inc_puts_issued();
        self.metrics.add_bytes_sent(len as u64);
        trace!(qp, request = %request, offset, len, "put posted");
        Ok(())
    }

    /// Accounts a completed fragment of a request and completes the request
    /// when nothing is left.
    pub(crate) fn request_frag_done(&mut self, request: RequestId, is_put: bool) {
        let mut fin = None;
        if let Some(req) = self.requests.get_mut(request.0) {
            if req.phase != RequestPhase::Active {
                return;
            }
            req.outstanding = req.outstanding.saturating_sub(1);
            if is_put {
                req.puts_outstanding = req.puts_outstanding.saturating_sub(1);
                if req.puts_outstanding == 0 && req.put_cursor == req.size && !req.fin_queued {
                    req.fin_queued = true;
                    req.data_scheduled = true;
                    req.outstanding += 1;
                    fin = Some((
                        req.peer,
                        WorkItem::Fin {
                            req: request,
                            seq: req.next_seq(),
                        },
                    ));
                }
            }
        }
        if let Some((Some(peer), item)) = fin {
            trace!(request = %request, "all puts landed, sending fin");
            if let Err(e) = self.enqueue(peer, vec![item]) {
                debug!(request = %request, error = %e, "fin not queued");
            }
        }
        self.maybe_complete(request);
    }

    /// Completes the request if its protocol has finished.
    pub(crate) fn maybe_complete(&mut self, request: RequestId) {
        let Some(req) = self.requests.get_mut(request.0) else {
            return;
        };
        if !req.is_complete() {
            return;
        }
        let (Some(peer), Some(protocol)) = (req.peer, req.protocol) else {
            warn!(request = %request, "finished request has no peer or protocol");
            return;
        };
        req.phase = RequestPhase::Done;
        let outcome = SendOutcome {
            request,
            peer,
            bytes: req.size,
            protocol,
            fragments: req.issued,
        };
        if let Some(tx) = req.completer.take() {
            let _ = tx.send(Ok(outcome));
        }
        self.metrics.inc_requests_completed();
        debug!(request = %request, "send complete");
    }

    /// Completes the request with `err` unless it already finished, and
    /// drops its source registration.
    pub(crate) fn fail_request(&mut self, request: RequestId, err: PtlError) {
        let source = {
            let Some(req) = self.requests.get_mut(request.0) else {
                return;
            };
            if req.phase != RequestPhase::Active {
                return;
            }
            req.phase = RequestPhase::Done;
            req.outstanding = 0;
            if let Some(tx) = req.completer.take() {
                let _ = tx.send(Err(err));
            }
            req.source.take()
        };
        if let Some((module, region)) = source {
            if let Err(e) = self.modules[module].registry.deregister(&region) {
                warn!(request = %request, error = %e, "source release failed");
            }
        }
        self.metrics.inc_requests_failed();
        debug!(request = %request, "send failed");
    }
}

/// Copies header and payload into a registered send buffer and builds the
/// work request.
fn stage(
    m: &mut Module,
    sb_id: DescriptorId,
    frag_id: DescriptorId,
    out: &Outgoing,
) -> PtlResult<SendWr> {
    let sb = m.send_bufs.get_mut(sb_id).ok_or(PtlError::Backpressure {
        resource: "send buffer",
    })?;
    let region = match sb.region {
        Some(region) => region,
        None => {
            let region = m
                .registry
                .register(&sb.buf, 0, sb.buf.len())
                .map_err(PtlError::RegistrationFailed)?;
            sb.region = Some(region);
            region
        }
    };
    let header = out.header.to_bytes()?;
    let mut used = header.len();
    if !sb.buf.write(0, &header) {
        return Err(PtlError::InvalidState("header exceeds send buffer".into()));
    }
    if let Some((src, src_off, len)) = &out.payload {
        if !sb.buf.copy_from(used, src, *src_off, *len) {
            return Err(PtlError::InvalidState("payload exceeds send buffer".into()));
        }
        used += len;
    }
    sb.used = used;
    Ok(SendWr {
        wr_id: frag_id.to_wr_id(),
        opcode: WrOpcode::Send,
        local: Sge {
            addr: sb.buf.addr(),
            len: used as u32,
            lkey: region.lkey,
        },
        remote: None,
    })
}

fn post_error(e: VerbsError) -> PtlError {
    match e {
        VerbsError::QueueFull(_) => PtlError::Backpressure {
            resource: "send queue",
        },
        other => PtlError::Verbs(other),
    }
}

//! Receive side of the fragment engine.
//!
//! Every inbound message is keyed by `(source process, sender request
//! cookie)`. The first fragment raises [`PtlEvent::Arrived`]; eager data
//! that lands before the messaging layer calls `matched` is held and copied
//! once the destination is known. Rendezvous starts are answered with an
//! ACK carrying the registered destination, and the FIN that follows the
//! RDMA writes completes the receive.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::component::{ComponentState, PtlComponent};
use crate::error::{PtlError, PtlResult};
use crate::header::{BaseHeader, FinHeader, FragHeader, FragKind, RemoteHandle};
use crate::memory::HostBuffer;
use crate::peer::{ProcName, WorkItem};
use crate::registry::RegionHandle;
use crate::request::{
    Completer, Completion, InboundId, Protocol, PtlEvent, RecvOutcome, RequestId, RequestPhase,
    SendFlags,
};
use crate::send::split;
use crate::verbs::QpNum;

/// Finished messages remembered to recognize late duplicates.
const RECENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundKind {
    Eager,
    Rendezvous { source: RemoteHandle },
}

#[derive(Debug)]
pub(crate) struct InboundMsg {
    pub(crate) peer: ProcName,
    pub(crate) src_req: u64,
    pub(crate) match_bits: u64,
    pub(crate) msg_len: usize,
    pub(crate) kind: InboundKind,
    /// The sender copies the data in eager fragments.
    pub(crate) fallback: bool,
    pub(crate) dest: Option<(HostBuffer, usize)>,
    pub(crate) held: Vec<(usize, Vec<u8>)>,
    pub(crate) bytes_received: usize,
    pub(crate) seen: HashSet<u32>,
    pub(crate) completer: Option<Completer<RecvOutcome>>,
    pub(crate) dest_region: Option<(usize, RegionHandle)>,
}

impl InboundMsg {
    fn new(peer: ProcName, base: &BaseHeader, kind: InboundKind) -> Self {
        Self {
            peer,
            src_req: base.src_req,
            match_bits: base.match_bits,
            msg_len: base.msg_len as usize,
            kind,
            fallback: false,
            dest: None,
            held: Vec::new(),
            bytes_received: 0,
            seen: HashSet::new(),
            completer: None,
            dest_region: None,
        }
    }

    fn is_matched(&self) -> bool {
        self.dest.is_some()
    }

    /// Copies `data` to message offset `offset` of the destination.
    fn place(&mut self, offset: usize, data: &[u8]) -> bool {
        match &self.dest {
            Some((buf, base)) if buf.write(base + offset, data) => {
                self.bytes_received += data.len();
                true
            }
            _ => false,
        }
    }

    /// Returns true once every byte arrived through eager fragments.
    fn copy_done(&self) -> bool {
        let copied = matches!(self.kind, InboundKind::Eager) || self.fallback;
        copied && self.is_matched() && self.bytes_received >= self.msg_len
    }
}

/// Inbound messages by id and by sender key.
#[derive(Debug, Default)]
pub(crate) struct InboundTable {
    msgs: HashMap<u64, InboundMsg>,
    by_src: HashMap<(ProcName, u64), u64>,
    recent: VecDeque<(ProcName, u64)>,
    recent_set: HashSet<(ProcName, u64)>,
    next: u64,
}

impl InboundTable {
    fn insert(&mut self, msg: InboundMsg) -> InboundId {
        self.next += 1;
        let id = self.next;
        self.by_src.insert((msg.peer, msg.src_req), id);
        self.msgs.insert(id, msg);
        InboundId(id)
    }

    fn find(&self, peer: ProcName, src_req: u64) -> Option<InboundId> {
        self.by_src.get(&(peer, src_req)).copied().map(InboundId)
    }

    fn is_finished(&self, peer: ProcName, src_req: u64) -> bool {
        self.recent_set.contains(&(peer, src_req))
    }

    pub(crate) fn get_mut(&mut self, id: InboundId) -> Option<&mut InboundMsg> {
        self.msgs.get_mut(&id.0)
    }

    /// Removes a finished message and remembers its key.
    fn finish(&mut self, id: InboundId) -> Option<InboundMsg> {
        let msg = self.msgs.remove(&id.0)?;
        let key = (msg.peer, msg.src_req);
        self.by_src.remove(&key);
        if self.recent.len() == RECENT_CAPACITY {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        self.recent.push_back(key);
        self.recent_set.insert(key);
        Some(msg)
    }

    /// Removes every message from `peer`.
    pub(crate) fn drain_peer(&mut self, peer: ProcName) -> Vec<(InboundId, InboundMsg)> {
        let ids: Vec<u64> = self
            .msgs
            .iter()
            .filter(|(_, m)| m.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        self.recent.retain(|(p, _)| *p != peer);
        self.recent_set.retain(|(p, _)| *p != peer);
        ids.into_iter()
            .filter_map(|id| {
                let msg = self.msgs.remove(&id)?;
                self.by_src.remove(&(msg.peer, msg.src_req));
                Some((InboundId(id), msg))
            })
            .collect()
    }

    /// Returns true if a message from `peer` is in progress.
    pub(crate) fn has_peer(&self, peer: ProcName) -> bool {
        self.msgs.values().any(|m| m.peer == peer)
    }

    /// Number of messages in progress.
    pub(crate) fn len(&self) -> usize {
        self.msgs.len()
    }
}

impl PtlComponent {
    /// Supplies the destination for an arrived message: `msg_len` bytes at
    /// `dest[offset..]`. The returned completion resolves once every byte
    /// has been placed.
    pub fn matched(
        &self,
        inbound: InboundId,
        dest: HostBuffer,
        offset: usize,
    ) -> PtlResult<Completion<RecvOutcome>> {
        let mut st = self.inner.lock();
        st.match_inbound(inbound, dest, offset)
    }
}

impl ComponentState {
    pub(crate) fn match_inbound(
        &mut self,
        inbound: InboundId,
        dest: HostBuffer,
        offset: usize,
    ) -> PtlResult<Completion<RecvOutcome>> {
        let module = {
            let msg = self
                .inbound
                .get_mut(inbound)
                .ok_or(PtlError::UnknownInbound(inbound.get()))?;
            if msg.is_matched() {
                return Err(PtlError::InvalidState(format!("{} already matched", inbound)));
            }
            if offset.checked_add(msg.msg_len).map_or(true, |end| end > dest.len()) {
                return Err(PtlError::InvalidState(format!(
                    "{} bytes at offset {} exceed destination of {} bytes",
                    msg.msg_len,
                    offset,
                    dest.len()
                )));
            }
            self.peers
                .get(&msg.peer)
                .map(|p| p.module)
                .ok_or(PtlError::UnknownPeer { peer: msg.peer })?
        };
        let (tx, completion) = Completion::channel();

        let Some(msg) = self.inbound.get_mut(inbound) else {
            return Err(PtlError::UnknownInbound(inbound.get()));
        };
        msg.completer = Some(tx);
        msg.dest = Some((dest.clone(), offset));
        let peer = msg.peer;
        let kind = msg.kind;
        match kind {
            InboundKind::Eager => {
                for (off, data) in std::mem::take(&mut msg.held) {
                    msg.place(off, &data);
                }
                trace!(inbound = %inbound, "eager message matched");
                self.try_finish_copy(inbound);
            }
            InboundKind::Rendezvous { .. } => {
                let handle = match self.modules[module]
                    .registry
                    .register(&dest, offset, msg.msg_len)
                {
                    Ok(region) => {
                        msg.dest_region = Some((module, region));
                        RemoteHandle {
                            addr: dest.addr_at(offset),
                            size: msg.msg_len as u64,
                            rkey: region.rkey,
                        }
                    }
                    Err(e) => {
                        debug!(inbound = %inbound, error = %e, "destination registration failed, asking for copies");
                        msg.fallback = true;
                        self.metrics.inc_copy_fallbacks();
                        RemoteHandle {
                            addr: 0,
                            size: 0,
                            rkey: 0,
                        }
                    }
                };
                let item = WorkItem::Ack {
                    inbound,
                    src_req: msg.src_req,
                    handle,
                };
                if let Err(e) = self.enqueue(peer, vec![item]) {
                    warn!(inbound = %inbound, error = %e, "ack not queued");
                }
            }
        }
        Ok(completion)
    }

    /// Dispatches a received fragment.
    pub(crate) fn handle_fragment(&mut self, module: usize, qp: QpNum, bytes: &[u8]) {
        let Some(peer) = self.modules[module].qp_owner.get(&qp).copied() else {
            warn!(qp, "fragment on unknown queue pair dropped");
            self.metrics.inc_discarded_fragments();
            return;
        };
        let mut cursor = bytes;
        let header = match FragHeader::decode(&mut cursor) {
            Ok(h) => h,
            Err(e) => {
                warn!(peer = %peer, error = %e, "malformed fragment dropped");
                self.metrics.inc_discarded_fragments();
                return;
            }
        };
        match header.kind() {
            FragKind::Eager => {
                let len = header.base.frag_len as usize;
                match cursor.get(..len) {
                    Some(payload) => self.on_eager(peer, &header.base, payload),
                    None => {
                        warn!(peer = %peer, len, "short eager fragment dropped");
                        self.metrics.inc_discarded_fragments();
                    }
                }
            }
            FragKind::Rndv => self.on_rndv_start(peer, &header),
            FragKind::Ack => self.on_ack(peer, &header),
            FragKind::Fin => self.on_fin(peer, &header),
            FragKind::FinAck => self.on_fin_ack(peer, &header),
        }
    }

    fn discard(&self, peer: ProcName, base: &BaseHeader, why: &str) {
        debug!(peer = %peer, kind = ?base.kind, src_req = base.src_req, seq = base.seq, why, "fragment discarded");
        self.metrics.inc_discarded_fragments();
    }

    fn on_eager(&mut self, peer: ProcName, base: &BaseHeader, payload: &[u8]) {
        if self.inbound.is_finished(peer, base.src_req) {
            return self.discard(peer, base, "message already complete");
        }
        let id = match self.inbound.find(peer, base.src_req) {
            Some(id) => id,
            None => {
                let id = self
                    .inbound
                    .insert(InboundMsg::new(peer, base, InboundKind::Eager));
                self.emit(PtlEvent::Arrived {
                    inbound: id,
                    peer,
                    match_bits: base.match_bits,
                    msg_len: base.msg_len,
                    flags: base.flags,
                });
                id
            }
        };
        let Some(msg) = self.inbound.get_mut(id) else {
            return;
        };
        let offset = base.frag_offset as usize;
        if msg.seen.contains(&base.seq) {
            return self.discard(peer, base, "duplicate sequence");
        }
        if offset.checked_add(payload.len()).map_or(true, |end| end > msg.msg_len) {
            return self.discard(peer, base, "fragment outside message");
        }
        msg.seen.insert(base.seq);
        if msg.is_matched() {
            msg.place(offset, payload);
        } else {
            msg.held.push((offset, payload.to_vec()));
        }
        self.try_finish_copy(id);
    }

    /// Completes a copied message once all bytes are placed.
    fn try_finish_copy(&mut self, id: InboundId) {
        let done = self.inbound.get_mut(id).map_or(false, |m| m.copy_done());
        if done {
            self.complete_inbound(id);
        }
    }

    fn complete_inbound(&mut self, id: InboundId) {
        let Some(mut msg) = self.inbound.finish(id) else {
            return;
        };
        self.metrics.add_bytes_received(msg.bytes_received as u64);
        let outcome = RecvOutcome {
            inbound: id,
            peer: msg.peer,
            bytes: msg.bytes_received,
            match_bits: msg.match_bits,
        };
        if let Some(tx) = msg.completer.take() {
            let _ = tx.send(Ok(outcome));
        }
        debug!(inbound = %id, peer = %msg.peer, bytes = msg.bytes_received, "receive complete");
    }

    fn on_rndv_start(&mut self, peer: ProcName, header: &FragHeader) {
        let base = &header.base;
        if self.inbound.is_finished(peer, base.src_req)
            || self.inbound.find(peer, base.src_req).is_some()
        {
            return self.discard(peer, base, "duplicate rendezvous start");
        }
        let Some(source) = header.handle() else {
            return self.discard(peer, base, "rendezvous start without handle");
        };
        let id = self
            .inbound
            .insert(InboundMsg::new(peer, base, InboundKind::Rendezvous { source }));
        trace!(inbound = %id, peer = %peer, len = base.msg_len, "rendezvous start");
        self.emit(PtlEvent::Arrived {
            inbound: id,
            peer,
            match_bits: base.match_bits,
            msg_len: base.msg_len,
            flags: base.flags,
        });
    }

    /// Sender side: the receiver advertised its destination.
    fn on_ack(&mut self, peer: ProcName, header: &FragHeader) {
        let base = &header.base;
        let request = RequestId::from_cookie(base.src_req);
        let eager_limit = self.config.eager_limit;
        let Some(handle) = header.handle() else {
            return self.discard(peer, base, "ack without handle");
        };
        let Some(req) = self.requests.get_mut(request.0) else {
            return self.discard(peer, base, "ack for unknown request");
        };
        let awaiting = req.phase == RequestPhase::Active
            && req.protocol == Some(Protocol::Rendezvous)
            && req.remote.is_none()
            && req.peer == Some(peer);
        if !awaiting {
            return self.discard(peer, base, "unexpected ack");
        }
        req.dst_req = base.dst_req;

        if handle.size == 0 {
            // receiver could not register; copy the data instead
            let source = req.source.take();
            req.protocol = Some(Protocol::CopyFallback);
            req.data_scheduled = true;
            let size = req.size;
            let items: Vec<WorkItem> = split(size, eager_limit)
                .into_iter()
                .map(|(offset, len)| WorkItem::Eager {
                    req: request,
                    seq: req.next_seq(),
                    offset,
                    len,
                })
                .collect();
            req.outstanding += items.len();
            if let Some((module, region)) = source {
                if let Err(e) = self.modules[module].registry.deregister(&region) {
                    warn!(request = %request, error = %e, "source release failed");
                }
            }
            self.metrics.inc_copy_fallbacks();
            debug!(request = %request, fragments = items.len(), "receiver asked for copies");
            if let Err(e) = self.enqueue(peer, items) {
                debug!(request = %request, error = %e, "copy fragments not queued");
            }
            // the rendezvous start already completed; nothing else may be pending
            self.maybe_complete(request);
            return;
        }

        if (handle.size as usize) < req.size {
            warn!(request = %request, advertised = handle.size, needed = req.size, "destination too small");
            self.fail_request(request, PtlError::InvalidState("destination smaller than message".into()));
            return;
        }
        req.remote = Some(handle);
        let size = req.size;
        if req.flags.contains(SendFlags::DEFER_PUT) {
            trace!(request = %request, "ack received, puts deferred to caller");
            self.emit(PtlEvent::Acked { request, peer });
            return;
        }
        let items = self.schedule_puts(request, 0, size);
        trace!(request = %request, puts = items.len(), "ack received");
        if let Err(e) = self.enqueue(peer, items) {
            debug!(request = %request, error = %e, "puts not queued");
        }
    }

    /// Receiver side: every RDMA write landed.
    fn on_fin(&mut self, peer: ProcName, header: &FragHeader) {
        let base = &header.base;
        let id = InboundId(base.dst_req);
        let Some(fin) = header.fin() else {
            return self.discard(peer, base, "fin without region");
        };
        let source = {
            let Some(msg) = self.inbound.get_mut(id) else {
                return self.discard(peer, base, "duplicate fin");
            };
            let expected = match (msg.kind, &msg.dest) {
                (InboundKind::Rendezvous { source }, Some((buf, off)))
                    if msg.peer == peer && !msg.fallback =>
                {
                    (fin.mr_addr == buf.addr_at(*off) && fin.mr_size == msg.msg_len as u64)
                        .then_some(source)
                }
                _ => None,
            };
            let Some(source) = expected else {
                return self.discard(peer, base, "fin does not name this message's region");
            };
            msg.bytes_received = msg.msg_len;
            if let Some((module, region)) = msg.dest_region.take() {
                if let Err(e) = self.modules[module].registry.deregister(&region) {
                    warn!(inbound = %id, error = %e, "destination release failed");
                }
            }
            source
        };
        let src_req = base.src_req;
        self.complete_inbound(id);
        let item = WorkItem::FinAck {
            src_req,
            fin: FinHeader {
                mr_addr: source.addr,
                mr_size: source.size,
            },
        };
        if let Err(e) = self.enqueue(peer, vec![item]) {
            debug!(inbound = %id, error = %e, "fin ack not queued");
        }
    }

    /// Sender side: the receiver released its destination.
    fn on_fin_ack(&mut self, peer: ProcName, header: &FragHeader) {
        let base = &header.base;
        let request = RequestId::from_cookie(base.src_req);
        let Some(fin) = header.fin() else {
            return self.discard(peer, base, "fin ack without region");
        };
        let source = {
            let Some(req) = self.requests.get_mut(request.0) else {
                return self.discard(peer, base, "fin ack for unknown request");
            };
            let names_source = req
                .buf
                .as_ref()
                .map_or(false, |b| b.addr_at(req.base) == fin.mr_addr)
                && fin.mr_size == req.size as u64;
            if req.phase != RequestPhase::Active
                || !req.fin_queued
                || req.fin_acked
                || req.peer != Some(peer)
                || !names_source
            {
                return self.discard(peer, base, "unexpected fin ack");
            }
            req.fin_acked = true;
            req.source.take()
        };
        if let Some((module, region)) = source {
            if let Err(e) = self.modules[module].registry.deregister(&region) {
                warn!(request = %request, error = %e, "source release failed");
            }
        }
        trace!(request = %request, "fin acknowledged");
        self.maybe_complete(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::PtlConfig;
    use crate::peer::ProcInfo;
    use crate::sim::{SimConfig, SimNetwork};
    use crate::verbs::{EndpointAddr, Verbs};

    fn base(src_req: u64, len: u64) -> BaseHeader {
        BaseHeader {
            src_req,
            msg_len: len,
            ..BaseHeader::new(FragKind::Eager)
        }
    }

    #[test]
    fn test_table_keys_by_sender() {
        let mut table = InboundTable::default();
        let a = ProcName::new(1, 1);
        let b = ProcName::new(1, 2);
        let ia = table.insert(InboundMsg::new(a, &base(5, 10), InboundKind::Eager));
        let ib = table.insert(InboundMsg::new(b, &base(5, 10), InboundKind::Eager));
        assert_ne!(ia, ib);
        assert_eq!(table.find(a, 5), Some(ia));
        assert_eq!(table.find(b, 5), Some(ib));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_finish_remembers_key() {
        let mut table = InboundTable::default();
        let a = ProcName::new(1, 1);
        let id = table.insert(InboundMsg::new(a, &base(7, 1), InboundKind::Eager));
        assert!(table.finish(id).is_some());
        assert!(table.find(a, 7).is_none());
        assert!(table.is_finished(a, 7));
        assert!(table.finish(id).is_none());
    }

    #[test]
    fn test_recent_is_bounded() {
        let mut table = InboundTable::default();
        let a = ProcName::new(1, 1);
        for i in 0..(RECENT_CAPACITY as u64 + 10) {
            let id = table.insert(InboundMsg::new(a, &base(i, 1), InboundKind::Eager));
            table.finish(id);
        }
        assert!(!table.is_finished(a, 0));
        assert!(table.is_finished(a, RECENT_CAPACITY as u64 + 9));
        assert_eq!(table.recent.len(), RECENT_CAPACITY);
    }

    #[test]
    fn test_drain_peer() {
        let mut table = InboundTable::default();
        let a = ProcName::new(1, 1);
        let b = ProcName::new(1, 2);
        table.insert(InboundMsg::new(a, &base(1, 1), InboundKind::Eager));
        table.insert(InboundMsg::new(b, &base(2, 1), InboundKind::Eager));
        let drained = table.drain_peer(a);
        assert_eq!(drained.len(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.find(a, 1).is_none());
    }

    #[test]
    fn test_place_and_copy_done() {
        let mut msg = InboundMsg::new(ProcName::new(1, 1), &base(1, 4), InboundKind::Eager);
        assert!(!msg.copy_done());
        msg.dest = Some((HostBuffer::zeroed(8), 2));
        assert!(msg.place(0, &[1, 2]));
        assert!(msg.place(2, &[3, 4]));
        assert!(msg.copy_done());
        let (buf, _) = msg.dest.as_ref().unwrap();
        assert_eq!(buf.read(2, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    fn eager_bytes(src_req: u64, seq: u32, offset: u64, payload: &[u8], msg_len: u64) -> Vec<u8> {
        let header = FragHeader::eager(BaseHeader {
            seq,
            frag_offset: offset,
            frag_len: payload.len() as u32,
            ..base(src_req, msg_len)
        });
        let mut bytes = header.to_bytes().unwrap().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_duplicate_and_late_fragments_discarded() {
        let net = SimNetwork::new(SimConfig::default());
        let dev = net.attach("sim1", EndpointAddr::new(1, 1, 1));
        let ptl = PtlComponent::init(PtlConfig::default(), vec![dev as Arc<dyn Verbs>]).unwrap();
        let mut events = ptl.events().unwrap();
        let peer = ProcName::new(0, 2);
        ptl.add_procs(&[ProcInfo {
            name: peer,
            endpoints: vec![EndpointAddr::new(1, 2, 1)],
        }]);
        let qp = 9;
        ptl.inner.lock().modules[0].qp_owner.insert(qp, peer);

        let first = eager_bytes(3, 0, 0, &[1, 2], 4);
        let second = eager_bytes(3, 1, 2, &[3, 4], 4);
        {
            let mut st = ptl.inner.lock();
            st.handle_fragment(0, qp, &first);
            st.handle_fragment(0, qp, &first);
        }
        assert_eq!(ptl.metrics().discarded_fragments, 1);
        let inbound = match events.try_recv().unwrap() {
            PtlEvent::Arrived { inbound, msg_len, .. } => {
                assert_eq!(msg_len, 4);
                inbound
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert!(events.try_recv().is_err());

        let dest = HostBuffer::zeroed(4);
        let mut done = ptl.matched(inbound, dest.clone(), 0).unwrap();
        assert!(done.try_take().is_none());
        ptl.inner.lock().handle_fragment(0, qp, &second);
        assert_eq!(done.try_take().unwrap().unwrap().bytes, 4);
        assert_eq!(dest.to_vec(), vec![1, 2, 3, 4]);

        // a retransmission after completion must not start a new message
        ptl.inner.lock().handle_fragment(0, qp, &second);
        assert_eq!(ptl.metrics().discarded_fragments, 2);
        assert!(events.try_recv().is_err());
    }
}

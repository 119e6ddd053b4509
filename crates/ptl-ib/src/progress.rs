//! Progress engine and connection management.
//!
//! [`PtlComponent::progress`] is the only place device state is observed:
//! it drains asynchronous events (connection requests, establishment,
//! disconnects, fatal errors), then completion queues, tops up receive
//! queues that ran short, and finally retries work parked by backpressure.
//! Connections are created lazily by the first send to a peer.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::component::{ComponentState, PtlComponent};
use crate::error::{PtlError, PtlResult};
use crate::free_list::DescriptorId;
use crate::peer::{PeerState, ProcName};
use crate::request::{FragOwner, PtlEvent, RequestId, RequestPhase};
use crate::verbs::{
    AsyncEvent, CompletionStatus, EndpointAddr, QpNum, RecvWr, Sge, WorkCompletion, WrOpcode,
};

impl PtlComponent {
    /// Runs one progress cycle and returns the number of device events and
    /// completions handled. A disabled component does nothing.
    pub fn progress(&self) -> usize {
        let mut st = self.inner.lock();
        if !st.enabled {
            return 0;
        }
        st.progress_cycle()
    }
}

impl ComponentState {
    fn progress_cycle(&mut self) -> usize {
        let mut handled = 0;
        for module in 0..self.modules.len() {
            let device = Arc::clone(&self.modules[module].device);
            while let Some(event) = device.poll_async_event() {
                self.handle_async(module, event);
                handled += 1;
            }
        }

        let batch = self.config.cq_poll_batch;
        for module in 0..self.modules.len() {
            let completions = self.modules[module].device.poll_cq(batch);
            handled += completions.len();
            for wc in completions {
                if wc.opcode == WrOpcode::Recv {
                    self.recv_completion(module, wc);
                } else {
                    self.send_completion(module, wc);
                }
            }
        }

        for module in 0..self.modules.len() {
            self.retry_reposts(module);
        }

        let ready: Vec<ProcName> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected && !p.pending.is_empty())
            .map(|p| p.name)
            .collect();
        for name in ready {
            if let Err(e) = self.flush_peer(name) {
                debug!(peer = %name, error = %e, "flush failed");
            }
        }
        handled
    }

    fn stale(&self, module: usize, wc: &WorkCompletion) {
        warn!(
            module,
            wr_id = wc.wr_id,
            qp = wc.qp_num,
            opcode = ?wc.opcode,
            "stale completion discarded"
        );
        self.metrics.inc_stale_completions();
    }

    fn send_completion(&mut self, module: usize, wc: WorkCompletion) {
        let id = DescriptorId::from_wr_id(wc.wr_id);
        let (owner, peer, is_put, send_buf) = match self.send_frags.get(id) {
            Some(f) if f.module == module && f.qp == wc.qp_num => {
                (f.owner, f.peer, f.is_put, f.send_buf)
            }
            _ => return self.stale(module, &wc),
        };
        if let Some(sb) = send_buf {
            if let Err(e) = self.modules[module].send_bufs.release(sb) {
                warn!(error = %e, "send buffer release failed");
            }
        }
        if let Err(e) = self.send_frags.release(id) {
            warn!(error = %e, "send fragment release failed");
        }
        if let Some(p) = peer.and_then(|n| self.peers.get_mut(&n)) {
            p.in_flight.remove(&id);
        }

        if wc.status != CompletionStatus::Success {
            warn!(qp = wc.qp_num, status = ?wc.status, opcode = ?wc.opcode, "send completed with error");
            if let Some(name) = peer {
                self.fail_peer(name, "send completion error");
            }
            return;
        }
        if let FragOwner::Request(request) = owner {
            self.request_frag_done(request, is_put);
        }
    }

    fn recv_completion(&mut self, module: usize, wc: WorkCompletion) {
        let id = DescriptorId::from_wr_id(wc.wr_id);
        let posted = self.recv_frags.get(id).and_then(|f| f.posted);
        if posted != Some((module, wc.qp_num)) {
            return self.stale(module, &wc);
        }
        let owner = self.modules[module].qp_owner.get(&wc.qp_num).copied();
        if wc.status != CompletionStatus::Success {
            warn!(qp = wc.qp_num, status = ?wc.status, "receive completed with error");
            self.drop_recv(id, owner);
            if let Some(name) = owner {
                self.fail_peer(name, "receive completion error");
            }
            return;
        }

        let bytes = self
            .recv_frags
            .get(id)
            .and_then(|f| f.buf.read(0, wc.byte_len as usize));
        if let Err(e) = self.post_recv_frag(module, wc.qp_num, id) {
            debug!(qp = wc.qp_num, error = %e, "receive repost failed");
            self.drop_recv(id, owner);
            self.modules[module].repost.push_back((wc.qp_num, 1));
        }
        match bytes {
            Some(bytes) => self.handle_fragment(module, wc.qp_num, &bytes),
            None => {
                warn!(qp = wc.qp_num, len = wc.byte_len, "receive longer than its buffer");
                self.metrics.inc_discarded_fragments();
            }
        }
    }

    fn drop_recv(&mut self, id: DescriptorId, owner: Option<ProcName>) {
        if let Some(p) = owner.and_then(|n| self.peers.get_mut(&n)) {
            p.posted_recvs.remove(&id);
        }
        if let Err(e) = self.recv_frags.release(id) {
            warn!(error = %e, "receive fragment release failed");
        }
    }

    /// Posts receive descriptor `id` on `qp`, registering its buffer with
    /// the module on first use.
    fn post_recv_frag(&mut self, module: usize, qp: QpNum, id: DescriptorId) -> PtlResult<()> {
        let m = &mut self.modules[module];
        let frag = self
            .recv_frags
            .get_mut(id)
            .ok_or_else(|| PtlError::InvalidState(format!("receive descriptor {} not live", id)))?;
        let region = match frag.regions.get(module).copied().flatten() {
            Some(region) => region,
            None => {
                let region = m
                    .registry
                    .register(&frag.buf, 0, frag.buf.len())
                    .map_err(|_| PtlError::Backpressure {
                        resource: "registered receive buffer",
                    })?;
                if let Some(slot) = frag.regions.get_mut(module) {
                    *slot = Some(region);
                }
                region
            }
        };
        m.device.post_recv(
            qp,
            RecvWr {
                wr_id: id.to_wr_id(),
                local: Sge {
                    addr: frag.buf.addr(),
                    len: frag.buf.len() as u32,
                    lkey: region.lkey,
                },
            },
        )?;
        frag.posted = Some((module, qp));
        Ok(())
    }

    /// Posts up to `count` receives on `qp`. A shortfall is remembered and
    /// retried on later progress cycles.
    fn prepost(&mut self, module: usize, qp: QpNum, name: ProcName, count: usize) -> usize {
        let mut posted = 0;
        while posted < count {
            let Some(id) = self.recv_frags.allocate() else {
                break;
            };
            if let Err(e) = self.post_recv_frag(module, qp, id) {
                debug!(peer = %name, qp, error = %e, "receive prepost stopped");
                if let Err(fe) = self.recv_frags.release(id) {
                    warn!(error = %fe, "receive fragment release failed");
                }
                break;
            }
            if let Some(p) = self.peers.get_mut(&name) {
                p.posted_recvs.insert(id);
            }
            posted += 1;
        }
        if posted < count {
            trace!(peer = %name, qp, missing = count - posted, "receive queue short");
            self.modules[module].repost.push_back((qp, count - posted));
        }
        posted
    }

    fn retry_reposts(&mut self, module: usize) {
        let short = std::mem::take(&mut self.modules[module].repost);
        for (qp, missing) in short {
            if let Some(name) = self.qp_peer(module, qp) {
                let live = self
                    .peers
                    .get(&name)
                    .map_or(false, |p| matches!(p.state, PeerState::Connecting | PeerState::Connected));
                if live {
                    self.prepost(module, qp, name, missing);
                }
            }
        }
    }

    /// The peer currently using `qp` on `module`.
    fn qp_peer(&self, module: usize, qp: QpNum) -> Option<ProcName> {
        let name = self.modules[module].qp_owner.get(&qp).copied()?;
        self.peers
            .get(&name)
            .filter(|p| p.qp == Some(qp))
            .map(|p| p.name)
    }

    fn handle_async(&mut self, module: usize, event: AsyncEvent) {
        trace!(module, event = ?event, "async event");
        match event {
            AsyncEvent::ConnectRequest { qp, remote } => self.on_connect_request(module, qp, remote),
            AsyncEvent::Established { qp } => match self.qp_peer(module, qp) {
                Some(name)
                    if self.peers.get(&name).map(|p| p.state) == Some(PeerState::Connecting) =>
                {
                    self.mark_connected(name)
                }
                _ => debug!(module, qp, "establishment for unknown queue pair ignored"),
            },
            AsyncEvent::Disconnected { qp } => self.on_disconnected(module, qp),
            AsyncEvent::QpFatal { qp } => match self.qp_peer(module, qp) {
                Some(name) => self.fail_peer(name, "queue pair fatal error"),
                None => debug!(module, qp, "fatal error on unused queue pair"),
            },
            AsyncEvent::PortError => {
                warn!(module, "port error");
                let names: Vec<ProcName> = self
                    .peers
                    .values()
                    .filter(|p| {
                        p.module == module
                            && matches!(p.state, PeerState::Connecting | PeerState::Connected)
                    })
                    .map(|p| p.name)
                    .collect();
                for name in names {
                    self.fail_peer(name, "port error");
                }
            }
        }
    }

    fn on_connect_request(&mut self, module: usize, qp: QpNum, remote: EndpointAddr) {
        let device = Arc::clone(&self.modules[module].device);
        let local = device.local_addr();
        let found = self
            .peers
            .values()
            .find(|p| p.module == module && p.remote == remote)
            .map(|p| (p.name, p.state));
        match found {
            Some((name, PeerState::Idle)) => self.accept_passive(module, qp, name),
            // both sides connected at once: the higher address yields
            Some((name, PeerState::Connecting)) if local > remote => {
                debug!(peer = %name, "simultaneous connect, taking the remote attempt");
                self.teardown(name);
                self.accept_passive(module, qp, name);
            }
            other => {
                match other {
                    Some((name, state)) => {
                        debug!(peer = %name, state = %state, qp, "connection request rejected")
                    }
                    None => warn!(remote = %remote, qp, "connection request from unknown process rejected"),
                }
                if let Err(e) = device.destroy_qp(qp) {
                    debug!(qp, error = %e, "reject failed");
                }
            }
        }
    }

    fn accept_passive(&mut self, module: usize, qp: QpNum, name: ProcName) {
        let device = Arc::clone(&self.modules[module].device);
        self.modules[module].qp_owner.insert(qp, name);
        if let Some(p) = self.peers.get_mut(&name) {
            p.qp = Some(qp);
        }
        let want = self.config.recv_prepost;
        self.prepost(module, qp, name, want);
        if let Err(e) = device.accept(qp) {
            warn!(peer = %name, qp, error = %e, "accept failed");
            if self.peers.get(&name).map(|p| p.state) == Some(PeerState::Connecting) {
                self.fail_peer(name, "accept failed");
            } else {
                self.teardown(name);
            }
            return;
        }
        self.mark_connected(name);
    }

    fn mark_connected(&mut self, name: ProcName) {
        let Some(p) = self.peers.get_mut(&name) else {
            return;
        };
        if p.state == PeerState::Connected || !p.transition(PeerState::Connected) {
            return;
        }
        info!(peer = %name, qp = ?p.qp, remote = %p.remote, "peer connected");
        self.metrics.connection_established();
        if let Err(e) = self.flush_peer(name) {
            debug!(peer = %name, error = %e, "flush after connect failed");
        }
    }

    fn on_disconnected(&mut self, module: usize, qp: QpNum) {
        let Some(name) = self.qp_peer(module, qp) else {
            debug!(module, qp, "disconnect of unused queue pair");
            return;
        };
        let busy = self.peers.get(&name).map_or(false, |p| p.has_outstanding_work())
            || !self.active_requests(name).is_empty()
            || self.inbound.has_peer(name);
        if busy {
            self.fail_peer(name, "remote disconnected");
        } else {
            info!(peer = %name, "remote disconnected");
            self.close_peer(name);
        }
    }

    /// Opens the connection to an idle peer.
    pub(crate) fn start_connect(&mut self, name: ProcName) -> PtlResult<()> {
        let (module, remote) = match self.peers.get_mut(&name) {
            Some(p) if p.state == PeerState::Idle => {
                p.transition(PeerState::Connecting);
                (p.module, p.remote)
            }
            Some(_) => return Ok(()),
            None => return Err(PtlError::UnknownPeer { peer: name }),
        };
        let device = Arc::clone(&self.modules[module].device);
        let qp = match device.create_qp() {
            Ok(qp) => qp,
            Err(e) => {
                warn!(peer = %name, error = %e, "queue pair creation failed");
                self.fail_peer(name, "queue pair creation failed");
                return Err(PtlError::ConnectionLost { peer: name });
            }
        };
        self.modules[module].qp_owner.insert(qp, name);
        if let Some(p) = self.peers.get_mut(&name) {
            p.qp = Some(qp);
        }
        let want = self.config.recv_prepost;
        self.prepost(module, qp, name, want);
        if let Err(e) = device.connect(qp, remote) {
            warn!(peer = %name, remote = %remote, error = %e, "connect failed");
            self.fail_peer(name, "connect failed");
            return Err(PtlError::ConnectionLost { peer: name });
        }
        debug!(peer = %name, qp, remote = %remote, "connecting");
        Ok(())
    }

    fn active_requests(&self, name: ProcName) -> Vec<RequestId> {
        self.requests
            .live_ids()
            .into_iter()
            .filter(|id| {
                self.requests
                    .get(*id)
                    .map_or(false, |r| r.phase == RequestPhase::Active && r.peer == Some(name))
            })
            .map(RequestId)
            .collect()
    }

    /// Destroys the peer's queue pair and returns every descriptor it held.
    fn teardown(&mut self, name: ProcName) {
        let Some(p) = self.peers.get_mut(&name) else {
            return;
        };
        let module = p.module;
        let qp = p.qp.take();
        let in_flight: Vec<DescriptorId> = p.in_flight.drain().collect();
        let recvs: Vec<DescriptorId> = p.posted_recvs.drain().collect();

        for id in in_flight {
            if let Some((m, Some(sb))) = self.send_frags.get(id).map(|f| (f.module, f.send_buf)) {
                if let Err(e) = self.modules[m].send_bufs.release(sb) {
                    warn!(error = %e, "send buffer release failed");
                }
            }
            if let Err(e) = self.send_frags.release(id) {
                warn!(error = %e, "send fragment release failed");
            }
        }
        for id in recvs {
            if let Err(e) = self.recv_frags.release(id) {
                warn!(error = %e, "receive fragment release failed");
            }
        }
        if let Some(qp) = qp {
            let m = &mut self.modules[module];
            m.qp_owner.remove(&qp);
            m.repost.retain(|(q, _)| *q != qp);
            if let Err(e) = m.device.destroy_qp(qp) {
                debug!(peer = %name, qp, error = %e, "queue pair destroy failed");
            }
        }
    }

    /// Fails every request and inbound message involving `name`.
    fn abort_peer_work(&mut self, name: ProcName) {
        for request in self.active_requests(name) {
            self.fail_request(request, PtlError::ConnectionLost { peer: name });
        }
        for (id, mut msg) in self.inbound.drain_peer(name) {
            if let Some((module, region)) = msg.dest_region.take() {
                if let Err(e) = self.modules[module].registry.deregister(&region) {
                    warn!(inbound = %id, error = %e, "destination release failed");
                }
            }
            if let Some(tx) = msg.completer.take() {
                let _ = tx.send(Err(PtlError::ConnectionLost { peer: name }));
            }
            debug!(inbound = %id, peer = %name, "inbound message dropped");
        }
    }

    /// Marks a connecting or connected peer failed. Its outstanding work
    /// completes with [`PtlError::ConnectionLost`] and later sends fail
    /// with [`PtlError::PeerFailed`].
    pub(crate) fn fail_peer(&mut self, name: ProcName, reason: &str) {
        let Some(was) = self.peers.get(&name).map(|p| p.state) else {
            return;
        };
        if !matches!(was, PeerState::Connecting | PeerState::Connected) {
            return;
        }
        warn!(peer = %name, reason, "peer failed");
        self.teardown(name);
        if let Some(p) = self.peers.get_mut(&name) {
            p.pending.clear();
            p.transition(PeerState::Failed);
        }
        if was == PeerState::Connected {
            self.metrics.connection_lost();
        }
        self.metrics.inc_peers_failed();
        self.abort_peer_work(name);
        self.emit(PtlEvent::PeerFailed { peer: name });
    }

    /// Tears a peer down on request.
    pub(crate) fn close_peer(&mut self, name: ProcName) {
        let Some(was) = self.peers.get(&name).map(|p| p.state) else {
            return;
        };
        self.teardown(name);
        if let Some(p) = self.peers.get_mut(&name) {
            p.pending.clear();
            p.transition(PeerState::Closed);
        }
        if was == PeerState::Connected {
            self.metrics.connection_lost();
        }
        self.abort_peer_work(name);
        debug!(peer = %name, "peer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PtlConfig;
    use crate::memory::HostBuffer;
    use crate::peer::ProcInfo;
    use crate::request::SendFlags;
    use crate::sim::{SimConfig, SimNetwork};
    use crate::verbs::Verbs;
    use tokio::sync::mpsc;

    struct Node {
        ptl: PtlComponent,
        addr: EndpointAddr,
        name: ProcName,
        events: mpsc::UnboundedReceiver<PtlEvent>,
    }

    fn node(net: &SimNetwork, lid: u32) -> Node {
        let addr = EndpointAddr::new(1, lid, 1);
        let dev = net.attach(&format!("sim{}", lid), addr);
        let ptl = PtlComponent::init(PtlConfig::default(), vec![dev as Arc<dyn Verbs>]).unwrap();
        let events = ptl.events().unwrap();
        Node {
            ptl,
            addr,
            name: ProcName::new(1, lid),
            events,
        }
    }

    fn link(a: &Node, b: &Node) {
        a.ptl.add_procs(&[ProcInfo {
            name: b.name,
            endpoints: vec![b.addr],
        }]);
        b.ptl.add_procs(&[ProcInfo {
            name: a.name,
            endpoints: vec![a.addr],
        }]);
    }

    fn pump(nodes: &[&Node]) {
        for _ in 0..32 {
            for n in nodes {
                n.ptl.progress();
            }
        }
    }

    fn arrivals(n: &mut Node) -> usize {
        let mut count = 0;
        while let Ok(ev) = n.events.try_recv() {
            if matches!(ev, PtlEvent::Arrived { .. }) {
                count += 1;
            }
        }
        count
    }

    /// Matches every arrived message into a fresh buffer.
    fn deliver(n: &mut Node) {
        while let Ok(ev) = n.events.try_recv() {
            if let PtlEvent::Arrived { inbound, msg_len, .. } = ev {
                let dest = HostBuffer::zeroed(msg_len as usize);
                n.ptl.matched(inbound, dest, 0).unwrap();
            }
        }
    }

    fn send_small(from: &Node, to: ProcName) -> crate::request::Completion<crate::request::SendOutcome> {
        let (id, completion) = from
            .ptl
            .request_init(HostBuffer::from_vec(vec![7; 32]), 32, 1)
            .unwrap();
        from.ptl.send(to, id, 0, 32, SendFlags::NONE).unwrap();
        completion
    }

    #[test]
    fn test_stale_completion_counted() {
        let net = SimNetwork::new(SimConfig::default());
        let a = node(&net, 1);
        net.inject_completion(
            a.addr,
            WorkCompletion {
                wr_id: 0xdead_0000_0001,
                status: CompletionStatus::Success,
                opcode: WrOpcode::Send,
                byte_len: 0,
                qp_num: 99,
            },
        );
        assert_eq!(a.ptl.progress(), 1);
        assert_eq!(a.ptl.metrics().stale_completions, 1);
    }

    #[test]
    fn test_failed_repost_is_remembered() {
        let net = SimNetwork::new(SimConfig::default());
        let a = node(&net, 1);
        let b = node(&net, 2);
        link(&a, &b);
        let mut done = send_small(&a, b.name);
        pump(&[&a, &b]);
        assert!(done.try_take().unwrap().is_ok());

        let mut st = a.ptl.inner.lock();
        let (qp, id) = {
            let peer = st.peers.get(&b.name).unwrap();
            (peer.qp.unwrap(), *peer.posted_recvs.iter().next().unwrap())
        };
        let posted = st.peers.get(&b.name).unwrap().posted_recvs.len();
        // the queue pair errors before the fatal event is seen
        net.inject_qp_fatal(a.addr, qp);
        st.recv_completion(
            0,
            WorkCompletion {
                wr_id: id.to_wr_id(),
                status: CompletionStatus::Success,
                opcode: WrOpcode::Recv,
                byte_len: 0,
                qp_num: qp,
            },
        );
        assert_eq!(st.peers.get(&b.name).unwrap().posted_recvs.len(), posted - 1);
        assert!(st.modules[0].repost.contains(&(qp, 1)));
    }

    #[test]
    fn test_first_send_connects() {
        let net = SimNetwork::new(SimConfig::default());
        let a = node(&net, 1);
        let mut b = node(&net, 2);
        link(&a, &b);
        let mut done = send_small(&a, b.name);
        assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Connecting));
        pump(&[&a, &b]);
        assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Connected));
        assert_eq!(b.ptl.peer_state(a.name), Some(PeerState::Connected));
        assert!(done.try_take().unwrap().is_ok());
        assert_eq!(arrivals(&mut b), 1);
        assert_eq!(a.ptl.metrics().connected_peers, 1);
    }

    #[test]
    fn test_simultaneous_connect_keeps_one_connection() {
        let net = SimNetwork::new(SimConfig::default());
        let mut a = node(&net, 1);
        let mut b = node(&net, 2);
        link(&a, &b);
        let mut from_a = send_small(&a, b.name);
        let mut from_b = send_small(&b, a.name);
        pump(&[&a, &b]);
        assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Connected));
        assert_eq!(b.ptl.peer_state(a.name), Some(PeerState::Connected));
        assert_eq!(net.qp_count(a.addr), 1);
        assert_eq!(net.qp_count(b.addr), 1);
        assert!(from_a.try_take().unwrap().is_ok());
        assert!(from_b.try_take().unwrap().is_ok());
        assert_eq!(arrivals(&mut a), 1);
        assert_eq!(arrivals(&mut b), 1);
    }

    #[test]
    fn test_connect_request_from_unknown_rejected() {
        let net = SimNetwork::new(SimConfig::default());
        let a = node(&net, 1);
        let b = node(&net, 2);
        a.ptl.add_procs(&[ProcInfo {
            name: b.name,
            endpoints: vec![b.addr],
        }]);
        let _pending = send_small(&a, b.name);
        pump(&[&a, &b]);
        assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Connecting));
        assert_eq!(net.qp_count(b.addr), 0);
    }

    #[test]
    fn test_qp_fatal_fails_peer() {
        let net = SimNetwork::new(SimConfig::default());
        let mut a = node(&net, 1);
        let b = node(&net, 2);
        link(&a, &b);
        let _warm = send_small(&a, b.name);
        pump(&[&a, &b]);
        let qp = a.ptl.inner.lock().peers[&b.name].qp.unwrap();
        net.inject_qp_fatal(a.addr, qp);
        a.ptl.progress();
        assert_eq!(a.ptl.peer_state(b.name), Some(PeerState::Failed));
        let mut failed = false;
        while let Ok(ev) = a.events.try_recv() {
            failed |= ev == PtlEvent::PeerFailed { peer: b.name };
        }
        assert!(failed);
        let m = a.ptl.metrics();
        assert_eq!(m.peers_failed, 1);
        assert_eq!(m.connected_peers, 0);
    }

    #[test]
    fn test_idle_disconnect_closes_peer() {
        let net = SimNetwork::new(SimConfig::default());
        let a = node(&net, 1);
        let mut b = node(&net, 2);
        link(&a, &b);
        let _warm = send_small(&a, b.name);
        pump(&[&a, &b]);
        deliver(&mut b);
        a.ptl.del_procs(&[b.name]);
        pump(&[&a, &b]);
        assert_eq!(b.ptl.peer_state(a.name), Some(PeerState::Closed));
        assert_eq!(b.ptl.metrics().peers_failed, 0);
        // announcing the process again replaces the closed peer
        b.ptl.add_procs(&[ProcInfo {
            name: a.name,
            endpoints: vec![a.addr],
        }]);
        assert_eq!(b.ptl.peer_state(a.name), Some(PeerState::Idle));
    }

    #[test]
    fn test_disabled_progress_is_noop() {
        let net = SimNetwork::new(SimConfig::default());
        let a = node(&net, 1);
        net.inject_completion(
            a.addr,
            WorkCompletion {
                wr_id: 1,
                status: CompletionStatus::Success,
                opcode: WrOpcode::Send,
                byte_len: 0,
                qp_num: 1,
            },
        );
        a.ptl.control(crate::config::ControlParam::Enable(false)).unwrap();
        assert_eq!(a.ptl.progress(), 0);
    }
}

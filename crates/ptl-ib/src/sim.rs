//! In-process RDMA fabric simulation.
//!
//! [`SimNetwork`] is a shared hub; every attached [`SimDevice`] is one
//! interface implementing [`Verbs`] with reliable-connected semantics:
//! sends are delivered in order into preposted receives (or parked until a
//! receive is posted), RDMA writes land directly in the target region,
//! and every send-queue work request produces exactly one completion.
//! The hub also exposes fault injection hooks used by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{VerbsError, VerbsResult};
use crate::memory::HostBuffer;
use crate::verbs::{
    AccessFlags, AsyncEvent, CompletionStatus, EndpointAddr, MrKeys, QpNum, QpState, RecvWr,
    SendWr, Verbs, WorkCompletion, WrOpcode,
};

/// Simulation limits applied to every attached device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Outstanding send-queue work requests per queue pair (default 128).
    pub send_queue_depth: usize,
    /// Pinned bytes allowed per device; `None` is unlimited (default).
    pub max_registered_bytes: Option<u64>,
    /// Memory regions allowed per device (default 4096).
    pub max_memory_regions: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: 128,
            max_registered_bytes: None,
            max_memory_regions: 4096,
        }
    }
}

/// Order in which held completions are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOrder {
    /// Same order they were generated.
    Fifo,
    /// Newest first.
    Reverse,
}

/// Counters for the whole simulated fabric.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FabricStats {
    /// Work requests completed successfully.
    pub operations_completed: u64,
    /// Work requests completed with an error.
    pub operations_failed: u64,
    /// Bytes moved by sends.
    pub bytes_sent: u64,
    /// Bytes moved by RDMA writes.
    pub bytes_written: u64,
    /// Successful registrations.
    pub registrations: u64,
    /// Deregistrations.
    pub deregistrations: u64,
}

struct SimMr {
    buf: HostBuffer,
    addr: u64,
    len: usize,
    access: AccessFlags,
}

impl SimMr {
    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr && addr + len as u64 <= self.addr + self.len as u64
    }
}

#[derive(Default)]
struct SimQp {
    state: QpState,
    remote: Option<(EndpointAddr, QpNum)>,
    recv_queue: VecDeque<RecvWr>,
    rnr_backlog: VecDeque<Vec<u8>>,
    send_outstanding: usize,
}

struct NodeState {
    name: String,
    port_active: bool,
    mrs: HashMap<u32, SimMr>,
    rkeys: HashMap<u32, u32>,
    registered_bytes: u64,
    registration_limit: Option<u64>,
    qps: HashMap<QpNum, SimQp>,
    next_qp: QpNum,
    cq: VecDeque<WorkCompletion>,
    held: Option<Vec<WorkCompletion>>,
    events: VecDeque<AsyncEvent>,
}

impl NodeState {
    fn push_completion(&mut self, wc: WorkCompletion) {
        match self.held.as_mut() {
            Some(held) => held.push(wc),
            None => self.cq.push_back(wc),
        }
    }

    fn read_local(&self, addr: u64, len: usize, lkey: u32) -> VerbsResult<Vec<u8>> {
        let mr = self.mrs.get(&lkey).ok_or(VerbsError::InvalidKey(lkey))?;
        if !mr.covers(addr, len) || !mr.access.contains(AccessFlags::LOCAL_READ) {
            return Err(VerbsError::AccessViolation { addr, len: len as u64 });
        }
        let offset = mr
            .buf
            .offset_of(addr, len)
            .ok_or(VerbsError::AccessViolation { addr, len: len as u64 })?;
        mr.buf
            .read(offset, len)
            .ok_or(VerbsError::AccessViolation { addr, len: len as u64 })
    }

    /// Lands `data` in the receive `wr` posted on `qp`.
    fn land(&mut self, qp: QpNum, wr: RecvWr, data: &[u8]) {
        let status = match self.mrs.get(&wr.local.lkey) {
            Some(mr)
                if data.len() <= wr.local.len as usize
                    && mr.covers(wr.local.addr, data.len())
                    && mr.access.contains(AccessFlags::LOCAL_WRITE) =>
            {
                match mr.buf.offset_of(wr.local.addr, data.len()) {
                    Some(offset) if mr.buf.write(offset, data) => CompletionStatus::Success,
                    _ => CompletionStatus::LocalError,
                }
            }
            _ => CompletionStatus::LocalError,
        };
        self.push_completion(WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode: WrOpcode::Recv,
            byte_len: data.len() as u32,
            qp_num: qp,
        });
    }
}

struct NetState {
    config: SimConfig,
    nodes: HashMap<EndpointAddr, NodeState>,
    next_key: u32,
    stats: FabricStats,
}

/// Shared hub connecting simulated devices.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetState>>,
}

impl SimNetwork {
    /// Creates an empty fabric.
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetState {
                config,
                nodes: HashMap::new(),
                next_key: 1,
                stats: FabricStats::default(),
            })),
        }
    }

    /// Attaches a device at `addr`. Attaching the same address twice
    /// returns a second handle to the existing device.
    pub fn attach(&self, name: &str, addr: EndpointAddr) -> Arc<SimDevice> {
        let mut net = self.inner.lock();
        let limit = net.config.max_registered_bytes;
        net.nodes.entry(addr).or_insert_with(|| NodeState {
            name: name.to_string(),
            port_active: true,
            mrs: HashMap::new(),
            rkeys: HashMap::new(),
            registered_bytes: 0,
            registration_limit: limit,
            qps: HashMap::new(),
            next_qp: 1,
            cq: VecDeque::new(),
            held: None,
            events: VecDeque::new(),
        });
        debug!(device = name, addr = %addr, "simulated device attached");
        Arc::new(SimDevice {
            net: self.clone(),
            addr,
            name: name.to_string(),
        })
    }

    /// Fabric-wide counters.
    pub fn stats(&self) -> FabricStats {
        self.inner.lock().stats.clone()
    }

    /// Moves `qp` into the error state and raises [`AsyncEvent::QpFatal`].
    pub fn inject_qp_fatal(&self, addr: EndpointAddr, qp: QpNum) {
        let mut net = self.inner.lock();
        if let Some(node) = net.nodes.get_mut(&addr) {
            if let Some(q) = node.qps.get_mut(&qp) {
                q.state = QpState::Error;
                q.recv_queue.clear();
                q.rnr_backlog.clear();
            }
            node.events.push_back(AsyncEvent::QpFatal { qp });
        }
    }

    /// Appends an arbitrary completion to the device's queue.
    pub fn inject_completion(&self, addr: EndpointAddr, wc: WorkCompletion) {
        let mut net = self.inner.lock();
        if let Some(node) = net.nodes.get_mut(&addr) {
            node.cq.push_back(wc);
        }
    }

    /// Starts holding back completions of `addr` until released.
    pub fn hold_completions(&self, addr: EndpointAddr) {
        let mut net = self.inner.lock();
        if let Some(node) = net.nodes.get_mut(&addr) {
            node.held.get_or_insert_with(Vec::new);
        }
    }

    /// Releases held completions in the requested order and stops holding.
    pub fn release_completions(&self, addr: EndpointAddr, order: CompletionOrder) -> usize {
        let mut net = self.inner.lock();
        let Some(node) = net.nodes.get_mut(&addr) else {
            return 0;
        };
        let mut held = node.held.take().unwrap_or_default();
        if order == CompletionOrder::Reverse {
            held.reverse();
        }
        let count = held.len();
        node.cq.extend(held);
        count
    }

    /// Brings a port up or down. Taking it down errors every queue pair.
    pub fn set_port_active(&self, addr: EndpointAddr, active: bool) {
        let mut net = self.inner.lock();
        if let Some(node) = net.nodes.get_mut(&addr) {
            node.port_active = active;
            if !active {
                for qp in node.qps.values_mut() {
                    qp.state = QpState::Error;
                }
                node.events.push_back(AsyncEvent::PortError);
            }
        }
    }

    /// Overrides the pinned-byte limit of one device.
    pub fn set_registration_limit(&self, addr: EndpointAddr, limit: Option<u64>) {
        let mut net = self.inner.lock();
        if let Some(node) = net.nodes.get_mut(&addr) {
            node.registration_limit = limit;
        }
    }

    /// Number of live memory regions on a device.
    pub fn registered_regions(&self, addr: EndpointAddr) -> usize {
        let net = self.inner.lock();
        net.nodes.get(&addr).map(|n| n.mrs.len()).unwrap_or(0)
    }

    /// State of a queue pair, if it exists.
    pub fn qp_state(&self, addr: EndpointAddr, qp: QpNum) -> Option<QpState> {
        let net = self.inner.lock();
        net.nodes.get(&addr)?.qps.get(&qp).map(|q| q.state)
    }

    /// Number of queue pairs on a device.
    pub fn qp_count(&self, addr: EndpointAddr) -> usize {
        let net = self.inner.lock();
        net.nodes.get(&addr).map(|n| n.qps.len()).unwrap_or(0)
    }
}

/// One simulated interface.
pub struct SimDevice {
    net: SimNetwork,
    addr: EndpointAddr,
    name: String,
}

impl SimDevice {
    /// The hub this device is attached to.
    pub fn network(&self) -> &SimNetwork {
        &self.net
    }
}

fn node_mut(net: &mut NetState, addr: EndpointAddr) -> VerbsResult<&mut NodeState> {
    net.nodes
        .get_mut(&addr)
        .ok_or(VerbsError::Unreachable(addr))
}

impl Verbs for SimDevice {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn local_addr(&self) -> EndpointAddr {
        self.addr
    }

    fn port_active(&self) -> bool {
        let net = self.net.inner.lock();
        net.nodes.get(&self.addr).map(|n| n.port_active).unwrap_or(false)
    }

    fn reg_mr(
        &self,
        buf: &HostBuffer,
        offset: usize,
        len: usize,
        access: AccessFlags,
    ) -> VerbsResult<MrKeys> {
        let addr = buf.addr_at(offset);
        if offset.checked_add(len).map_or(true, |end| end > buf.len()) {
            return Err(VerbsError::AccessViolation { addr, len: len as u64 });
        }
        let mut net = self.net.inner.lock();
        let max_regions = net.config.max_memory_regions;
        let key = net.next_key;
        let node = node_mut(&mut net, self.addr)?;
        if node.mrs.len() >= max_regions {
            return Err(VerbsError::ResourceExhausted { resource: "memory keys" });
        }
        if let Some(limit) = node.registration_limit {
            if node.registered_bytes + len as u64 > limit {
                return Err(VerbsError::ResourceExhausted { resource: "pinned memory" });
            }
        }
        let keys = MrKeys {
            lkey: key | 0x4000_0000,
            rkey: key | 0x8000_0000,
        };
        node.mrs.insert(
            keys.lkey,
            SimMr {
                buf: buf.clone(),
                addr,
                len,
                access,
            },
        );
        node.rkeys.insert(keys.rkey, keys.lkey);
        node.registered_bytes += len as u64;
        net.next_key = net.next_key.wrapping_add(1) & 0x3FFF_FFFF;
        net.stats.registrations += 1;
        trace!(device = %self.name, addr, len, lkey = keys.lkey, "memory registered");
        Ok(keys)
    }

    fn dereg_mr(&self, lkey: u32) -> VerbsResult<()> {
        let mut net = self.net.inner.lock();
        let node = node_mut(&mut net, self.addr)?;
        let mr = node.mrs.remove(&lkey).ok_or(VerbsError::InvalidKey(lkey))?;
        node.rkeys.retain(|_, l| *l != lkey);
        node.registered_bytes -= mr.len as u64;
        net.stats.deregistrations += 1;
        Ok(())
    }

    fn create_qp(&self) -> VerbsResult<QpNum> {
        let mut net = self.net.inner.lock();
        let node = node_mut(&mut net, self.addr)?;
        if !node.port_active {
            return Err(VerbsError::PortDown { device: node.name.clone() });
        }
        let qp = node.next_qp;
        node.next_qp += 1;
        node.qps.insert(
            qp,
            SimQp {
                state: QpState::Init,
                ..Default::default()
            },
        );
        Ok(qp)
    }

    fn connect(&self, qp: QpNum, remote: EndpointAddr) -> VerbsResult<()> {
        let mut net = self.net.inner.lock();
        {
            let node = node_mut(&mut net, self.addr)?;
            let q = node.qps.get(&qp).ok_or(VerbsError::InvalidQp(qp))?;
            if q.state != QpState::Init {
                return Err(VerbsError::InvalidQpState { qp, state: q.state.name() });
            }
        }
        let reachable = remote.subnet == self.addr.subnet
            && net.nodes.get(&remote).map_or(false, |n| n.port_active);
        if !reachable {
            return Err(VerbsError::Unreachable(remote));
        }
        let passive = {
            let peer = node_mut(&mut net, remote)?;
            let passive = peer.next_qp;
            peer.next_qp += 1;
            peer.qps.insert(
                passive,
                SimQp {
                    state: QpState::Init,
                    remote: Some((self.addr, qp)),
                    ..Default::default()
                },
            );
            peer.events.push_back(AsyncEvent::ConnectRequest {
                qp: passive,
                remote: self.addr,
            });
            passive
        };
        let node = node_mut(&mut net, self.addr)?;
        if let Some(q) = node.qps.get_mut(&qp) {
            q.remote = Some((remote, passive));
        }
        debug!(device = %self.name, qp, remote = %remote, passive, "connect request sent");
        Ok(())
    }

    fn accept(&self, qp: QpNum) -> VerbsResult<()> {
        let mut net = self.net.inner.lock();
        let (remote, remote_qp) = {
            let node = node_mut(&mut net, self.addr)?;
            let q = node.qps.get(&qp).ok_or(VerbsError::InvalidQp(qp))?;
            if q.state != QpState::Init {
                return Err(VerbsError::InvalidQpState { qp, state: q.state.name() });
            }
            q.remote.ok_or(VerbsError::InvalidQpState { qp, state: q.state.name() })?
        };
        let me = self.addr;
        let active_alive = net
            .nodes
            .get_mut(&remote)
            .and_then(|peer| {
                let q = peer.qps.get_mut(&remote_qp)?;
                if q.remote != Some((me, qp)) || q.state != QpState::Init {
                    return None;
                }
                q.state = QpState::ReadyToSend;
                peer.events.push_back(AsyncEvent::Established { qp: remote_qp });
                Some(())
            })
            .is_some();
        if !active_alive {
            return Err(VerbsError::Unreachable(remote));
        }
        let node = node_mut(&mut net, self.addr)?;
        if let Some(q) = node.qps.get_mut(&qp) {
            q.state = QpState::ReadyToSend;
        }
        Ok(())
    }

    fn destroy_qp(&self, qp: QpNum) -> VerbsResult<()> {
        let mut net = self.net.inner.lock();
        let removed = node_mut(&mut net, self.addr)?
            .qps
            .remove(&qp)
            .ok_or(VerbsError::InvalidQp(qp))?;
        // Only established connections notify the other side.
        if removed.state == QpState::ReadyToSend {
            if let Some((remote, remote_qp)) = removed.remote {
                if let Some(peer) = net.nodes.get_mut(&remote) {
                    if let Some(q) = peer.qps.get_mut(&remote_qp) {
                        q.remote = None;
                        peer.events.push_back(AsyncEvent::Disconnected { qp: remote_qp });
                    }
                }
            }
        }
        Ok(())
    }

    fn post_send(&self, qp: QpNum, wr: SendWr) -> VerbsResult<()> {
        if wr.opcode == WrOpcode::Recv {
            return Err(VerbsError::InvalidQpState { qp, state: "recv opcode on send queue" });
        }
        let mut net = self.net.inner.lock();
        let depth = net.config.send_queue_depth;
        let (data, remote) = {
            let node = node_mut(&mut net, self.addr)?;
            let q = node.qps.get(&qp).ok_or(VerbsError::InvalidQp(qp))?;
            if q.state != QpState::ReadyToSend {
                return Err(VerbsError::InvalidQpState { qp, state: q.state.name() });
            }
            if q.send_outstanding >= depth {
                return Err(VerbsError::QueueFull(qp));
            }
            let data = node.read_local(wr.local.addr, wr.local.len as usize, wr.local.lkey)?;
            (data, q.remote)
        };

        let status = match (wr.opcode, remote) {
            (_, None) => CompletionStatus::RemoteError,
            (WrOpcode::Send, Some((raddr, rqp))) => match net.nodes.get_mut(&raddr) {
                Some(peer) => {
                    let ready = peer
                        .qps
                        .get(&rqp)
                        .map_or(false, |q| q.state == QpState::ReadyToSend);
                    if ready {
                        let posted = peer.qps.get_mut(&rqp).and_then(|q| q.recv_queue.pop_front());
                        match posted {
                            Some(recv) => peer.land(rqp, recv, &data),
                            None => {
                                if let Some(q) = peer.qps.get_mut(&rqp) {
                                    q.rnr_backlog.push_back(data.clone());
                                }
                            }
                        }
                        CompletionStatus::Success
                    } else {
                        CompletionStatus::RemoteError
                    }
                }
                None => CompletionStatus::RemoteError,
            },
            (WrOpcode::RdmaWrite, Some((raddr, _))) => {
                let target = wr.remote.ok_or(VerbsError::AccessViolation {
                    addr: 0,
                    len: data.len() as u64,
                })?;
                let landed = net.nodes.get(&raddr).and_then(|peer| {
                    let lkey = peer.rkeys.get(&target.rkey)?;
                    let mr = peer.mrs.get(lkey)?;
                    if !mr.access.contains(AccessFlags::REMOTE_WRITE)
                        || !mr.covers(target.addr, data.len())
                    {
                        return None;
                    }
                    let offset = mr.buf.offset_of(target.addr, data.len())?;
                    mr.buf.write(offset, &data).then_some(())
                });
                if landed.is_some() {
                    CompletionStatus::Success
                } else {
                    CompletionStatus::RemoteError
                }
            }
            (WrOpcode::Recv, _) => unreachable!("rejected above"),
        };

        match status {
            CompletionStatus::Success => {
                net.stats.operations_completed += 1;
                if wr.opcode == WrOpcode::Send {
                    net.stats.bytes_sent += data.len() as u64;
                } else {
                    net.stats.bytes_written += data.len() as u64;
                }
            }
            _ => net.stats.operations_failed += 1,
        }

        let node = node_mut(&mut net, self.addr)?;
        if let Some(q) = node.qps.get_mut(&qp) {
            q.send_outstanding += 1;
        }
        node.push_completion(WorkCompletion {
            wr_id: wr.wr_id,
            status,
            opcode: wr.opcode,
            byte_len: data.len() as u32,
            qp_num: qp,
        });
        Ok(())
    }

    fn post_recv(&self, qp: QpNum, wr: RecvWr) -> VerbsResult<()> {
        let mut net = self.net.inner.lock();
        let node = node_mut(&mut net, self.addr)?;
        let parked = {
            let q = node.qps.get_mut(&qp).ok_or(VerbsError::InvalidQp(qp))?;
            if matches!(q.state, QpState::Reset | QpState::Error) {
                return Err(VerbsError::InvalidQpState { qp, state: q.state.name() });
            }
            let parked = q.rnr_backlog.pop_front();
            if parked.is_none() {
                q.recv_queue.push_back(wr);
            }
            parked
        };
        if let Some(data) = parked {
            node.land(qp, wr, &data);
        }
        Ok(())
    }

    fn poll_cq(&self, max: usize) -> Vec<WorkCompletion> {
        let mut net = self.net.inner.lock();
        let Some(node) = net.nodes.get_mut(&self.addr) else {
            return Vec::new();
        };
        let n = max.min(node.cq.len());
        let drained: Vec<WorkCompletion> = node.cq.drain(..n).collect();
        for wc in &drained {
            if wc.opcode != WrOpcode::Recv {
                if let Some(q) = node.qps.get_mut(&wc.qp_num) {
                    q.send_outstanding = q.send_outstanding.saturating_sub(1);
                }
            }
        }
        drained
    }

    fn poll_async_event(&self) -> Option<AsyncEvent> {
        let mut net = self.net.inner.lock();
        net.nodes.get_mut(&self.addr)?.events.pop_front()
    }
}

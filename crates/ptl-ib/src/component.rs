//! The transport component: explicit owner of every transport resource.
//!
//! A [`PtlComponent`] holds one [`Module`] per usable interface, the three
//! component-wide descriptor lists, the peer table and the inbound message
//! table. One mutex serializes all mutation; no call blocks on the device.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ControlParam, PtlConfig};
use crate::error::{PtlError, PtlResult};
use crate::free_list::{FreeList, FreeListStats};
use crate::header::MAX_HEADER_LEN;
use crate::memory::HostBuffer;
use crate::metrics::{PtlMetrics, PtlMetricsSnapshot};
use crate::peer::{Peer, PeerState, ProcInfo, ProcName};
use crate::recv::InboundTable;
use crate::registry::{MemRegistry, RegionHandle, RegistryStats};
use crate::request::{
    Completion, PtlEvent, RecvFrag, RequestId, RequestPhase, SendBuffer, SendFrag, SendOutcome,
    SendRequest,
};
use crate::verbs::{EndpointAddr, QpNum, Verbs};

/// One physical interface.
pub(crate) struct Module {
    pub(crate) device: Arc<dyn Verbs>,
    pub(crate) registry: MemRegistry,
    pub(crate) send_bufs: FreeList<SendBuffer>,
    /// Queue pairs short of preposted receives, with the missing count.
    pub(crate) repost: VecDeque<(QpNum, usize)>,
    pub(crate) qp_owner: HashMap<QpNum, ProcName>,
}

impl Module {
    fn new(device: Arc<dyn Verbs>, config: &PtlConfig, buf_capacity: usize) -> Self {
        let registry = MemRegistry::new(Arc::clone(&device), config.hints_table_size());
        Self {
            device,
            registry,
            send_bufs: FreeList::new("send buffer", config.free_list(), move || {
                SendBuffer::new(buf_capacity)
            }),
            repost: VecDeque::new(),
            qp_owner: HashMap::new(),
        }
    }
}

/// Everything guarded by the component mutex.
pub(crate) struct ComponentState {
    pub(crate) config: PtlConfig,
    pub(crate) enabled: bool,
    /// Largest payload the pre-registered buffers can carry.
    pub(crate) payload_capacity: usize,
    pub(crate) modules: Vec<Module>,
    pub(crate) requests: FreeList<SendRequest>,
    pub(crate) send_frags: FreeList<SendFrag>,
    pub(crate) recv_frags: FreeList<RecvFrag>,
    pub(crate) peers: BTreeMap<ProcName, Peer>,
    pub(crate) inbound: InboundTable,
    pub(crate) events: mpsc::UnboundedSender<PtlEvent>,
    pub(crate) metrics: Arc<PtlMetrics>,
}

impl ComponentState {
    pub(crate) fn emit(&self, event: PtlEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    pub(crate) fn check_peer(&self, name: ProcName) -> PtlResult<()> {
        if !self.enabled {
            return Err(PtlError::Disabled);
        }
        match self.peers.get(&name).map(|p| p.state) {
            None | Some(PeerState::Closed) => Err(PtlError::UnknownPeer { peer: name }),
            Some(PeerState::Failed) => Err(PtlError::PeerFailed { peer: name }),
            Some(_) => Ok(()),
        }
    }
}

/// Snapshot of component resources.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStats {
    /// Send request descriptors.
    pub requests: FreeListStats,
    /// Send fragment descriptors.
    pub send_frags: FreeListStats,
    /// Receive fragment descriptors.
    pub recv_frags: FreeListStats,
    /// Pre-registered send buffers, per module.
    pub send_buffers: Vec<FreeListStats>,
    /// Registration caches, per module.
    pub registries: Vec<RegistryStats>,
    /// Transport counters.
    pub metrics: PtlMetricsSnapshot,
}

/// RDMA point-to-point transport.
pub struct PtlComponent {
    pub(crate) inner: Mutex<ComponentState>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PtlEvent>>>,
    metrics: Arc<PtlMetrics>,
}

impl PtlComponent {
    /// Builds the component over `devices`. Interfaces whose port is down
    /// are skipped; without any usable interface the component declines.
    pub fn init(config: PtlConfig, devices: Vec<Arc<dyn Verbs>>) -> PtlResult<Self> {
        config.validate()?;
        let usable: Vec<Arc<dyn Verbs>> = devices
            .into_iter()
            .filter(|d| {
                let up = d.port_active();
                if !up {
                    warn!(device = d.device_name(), "port down, interface skipped");
                }
                up
            })
            .collect();
        if usable.is_empty() {
            return Err(PtlError::NoUsableInterface);
        }

        let payload_capacity = config.eager_limit;
        let buf_capacity = MAX_HEADER_LEN + payload_capacity;
        let module_count = usable.len();
        let modules: Vec<Module> = usable
            .into_iter()
            .map(|d| {
                info!(device = d.device_name(), addr = %d.local_addr(), "interface opened");
                Module::new(d, &config, buf_capacity)
            })
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PtlMetrics::new());
        let state = ComponentState {
            requests: FreeList::new("send request", config.free_list(), SendRequest::default),
            send_frags: FreeList::new("send fragment", config.free_list(), SendFrag::default),
            recv_frags: FreeList::new("recv fragment", config.free_list(), move || {
                RecvFrag::new(buf_capacity, module_count)
            }),
            config,
            enabled: true,
            payload_capacity,
            modules,
            peers: BTreeMap::new(),
            inbound: InboundTable::default(),
            events: tx,
            metrics: Arc::clone(&metrics),
        };
        Ok(Self {
            inner: Mutex::new(state),
            events_rx: Mutex::new(Some(rx)),
            metrics,
        })
    }

    /// Selection priority from the configuration.
    pub fn priority(&self) -> i32 {
        self.inner.lock().config.priority
    }

    /// Addresses of the opened interfaces.
    pub fn interfaces(&self) -> Vec<EndpointAddr> {
        let st = self.inner.lock();
        st.modules.iter().map(|m| m.device.local_addr()).collect()
    }

    /// Takes the event receiver. Only the first call returns it.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<PtlEvent>> {
        self.events_rx.lock().take()
    }

    /// Applies a runtime tuning request.
    pub fn control(&self, param: ControlParam) -> PtlResult<()> {
        let mut st = self.inner.lock();
        match param {
            ControlParam::Enable(on) => {
                st.enabled = on;
                info!(enabled = on, "transport enable changed");
            }
            ControlParam::EagerLimit(limit) => {
                if limit < MAX_HEADER_LEN || limit > st.payload_capacity {
                    return Err(PtlError::InvalidState(format!(
                        "eager limit {} outside [{}, {}]",
                        limit, MAX_HEADER_LEN, st.payload_capacity
                    )));
                }
                st.config.eager_limit = limit;
            }
            ControlParam::MaxPutSize(size) => {
                if size == 0 {
                    return Err(PtlError::InvalidState("max put size must be non-zero".into()));
                }
                st.config.max_put_size = size;
            }
        }
        Ok(())
    }

    /// Announces remote processes and returns those reachable through one
    /// of this component's interfaces.
    pub fn add_procs(&self, procs: &[ProcInfo]) -> Vec<ProcName> {
        let mut st = self.inner.lock();
        let mut reachable = Vec::with_capacity(procs.len());
        for info in procs {
            if let Some(existing) = st.peers.get(&info.name) {
                if existing.state != PeerState::Closed {
                    reachable.push(info.name);
                    continue;
                }
            }
            let route = st.modules.iter().enumerate().find_map(|(idx, m)| {
                let local = m.device.local_addr();
                info.endpoints
                    .iter()
                    .find(|ep| ep.subnet == local.subnet && **ep != local)
                    .map(|ep| (idx, *ep))
            });
            match route {
                Some((module, remote)) => {
                    debug!(peer = %info.name, module, remote = %remote, "peer added");
                    st.peers.insert(info.name, Peer::new(info.name, module, remote));
                    reachable.push(info.name);
                }
                None => debug!(peer = %info.name, "peer unreachable"),
            }
        }
        reachable
    }

    /// Removes peers. Outstanding work for them fails with
    /// [`PtlError::ConnectionLost`].
    pub fn del_procs(&self, names: &[ProcName]) {
        let mut st = self.inner.lock();
        for name in names {
            st.close_peer(*name);
            st.peers.remove(name);
        }
    }

    /// Connection state of a peer.
    pub fn peer_state(&self, name: ProcName) -> Option<PeerState> {
        self.inner.lock().peers.get(&name).map(|p| p.state)
    }

    /// Prepares a send request over `buffer[..len]`. `match_bits` travel
    /// with the message unchanged.
    pub fn request_init(
        &self,
        buffer: HostBuffer,
        len: usize,
        match_bits: u64,
    ) -> PtlResult<(RequestId, Completion<SendOutcome>)> {
        if len > buffer.len() {
            return Err(PtlError::InvalidState(format!(
                "request length {} exceeds buffer length {}",
                len,
                buffer.len()
            )));
        }
        let mut st = self.inner.lock();
        let Some(id) = st.requests.allocate() else {
            st.metrics.inc_backpressure();
            return Err(PtlError::Backpressure {
                resource: "send request",
            });
        };
        let (tx, completion) = Completion::channel();
        if let Some(req) = st.requests.get_mut(id) {
            req.buf = Some(buffer);
            req.len = len;
            req.match_bits = match_bits;
            req.completer = Some(tx);
        }
        Ok((RequestId(id), completion))
    }

    /// Aborts a request and returns its descriptor. Fails with
    /// [`PtlError::RequestInFlight`] once any fragment reached the wire.
    pub fn request_fini(&self, request: RequestId) -> PtlResult<()> {
        let mut st = self.inner.lock();
        let (phase, issued, peer, source) = {
            let req = st
                .requests
                .get(request.0)
                .ok_or(PtlError::UnknownRequest(request.cookie()))?;
            (req.phase, req.issued, req.peer, req.source)
        };
        if phase == RequestPhase::Active {
            if issued > 0 {
                return Err(PtlError::RequestInFlight(request.cookie()));
            }
            if let Some(p) = peer.and_then(|n| st.peers.get_mut(&n)) {
                p.pending.retain(|item| item.request() != Some(request));
            }
            if let Some((module, region)) = source {
                if let Err(e) = st.modules[module].registry.deregister(&region) {
                    warn!(request = %request, error = %e, "source release failed");
                }
            }
            debug!(request = %request, "request aborted before issue");
        }
        st.requests.release(request.0)?;
        Ok(())
    }

    /// Returns a finished (or never started) request descriptor.
    pub fn request_return(&self, request: RequestId) -> PtlResult<()> {
        let mut st = self.inner.lock();
        let phase = st
            .requests
            .get(request.0)
            .map(|r| r.phase)
            .ok_or(PtlError::UnknownRequest(request.cookie()))?;
        if phase == RequestPhase::Active {
            return Err(PtlError::RequestInFlight(request.cookie()));
        }
        st.requests.release(request.0)?;
        Ok(())
    }

    /// Finds the cached registration covering a local range, if any.
    pub fn registration(&self, addr: u64, len: usize) -> Option<RegionHandle> {
        let st = self.inner.lock();
        st.modules.iter().find_map(|m| m.registry.lookup(addr, len))
    }

    /// Transport counters.
    pub fn metrics(&self) -> PtlMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Resource snapshot.
    pub fn stats(&self) -> ComponentStats {
        let st = self.inner.lock();
        ComponentStats {
            requests: st.requests.stats(),
            send_frags: st.send_frags.stats(),
            recv_frags: st.recv_frags.stats(),
            send_buffers: st.modules.iter().map(|m| m.send_bufs.stats()).collect(),
            registries: st.modules.iter().map(|m| m.registry.stats()).collect(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Tears down every peer and unpins all memory. The component stays
    /// disabled afterwards.
    pub fn finalize(&self) {
        let mut st = self.inner.lock();
        let names: Vec<ProcName> = st.peers.keys().copied().collect();
        for name in names {
            st.close_peer(name);
        }
        st.peers.clear();
        let mut leftover = 0;
        for m in st.modules.iter_mut() {
            leftover += m.registry.clear();
        }
        st.enabled = false;
        info!(
            unpinned = leftover,
            metrics = ?self.metrics.snapshot(),
            "transport finalized"
        );
    }
}

impl std::fmt::Debug for PtlComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtlComponent")
            .field("interfaces", &self.interfaces())
            .field("metrics", &self.metrics)
            .finish()
    }
}

//! Two-process harness over the simulated fabric.

#![allow(dead_code)]

use std::sync::Arc;

use ptl_ib::{
    Completion, EndpointAddr, HostBuffer, InboundId, ProcInfo, ProcName, PtlComponent, PtlConfig,
    PtlEvent, RecvOutcome, SendFlags, SimConfig, SimNetwork, Verbs,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound on progress cycles before a test gives up.
pub const MAX_CYCLES: usize = 2000;

pub struct Proc {
    pub name: ProcName,
    pub addr: EndpointAddr,
    pub ptl: PtlComponent,
    events: UnboundedReceiver<PtlEvent>,
    pub log: Vec<PtlEvent>,
}

/// A matched inbound message.
pub struct Landing {
    pub inbound: InboundId,
    pub match_bits: u64,
    pub flags: u8,
    pub dest: HostBuffer,
    pub done: Completion<RecvOutcome>,
}

impl Proc {
    pub fn open(net: &SimNetwork, lid: u32, config: PtlConfig) -> Self {
        let addr = EndpointAddr::new(0xfe80, lid, 1);
        let device = net.attach(&format!("sim{}", lid), addr);
        let ptl = PtlComponent::init(config, vec![device as Arc<dyn Verbs>]).unwrap();
        let events = ptl.events().unwrap();
        Self {
            name: ProcName::new(7, lid),
            addr,
            ptl,
            events,
            log: Vec::new(),
        }
    }

    pub fn info(&self) -> ProcInfo {
        ProcInfo {
            name: self.name,
            endpoints: vec![self.addr],
        }
    }

    pub fn poll_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.log.push(event);
        }
    }

    pub fn saw(&mut self, wanted: &PtlEvent) -> bool {
        self.poll_events();
        self.log.contains(wanted)
    }

    /// Removes and returns the arrivals logged so far.
    pub fn take_arrivals(&mut self) -> Vec<(InboundId, u64, u64, u8)> {
        self.poll_events();
        let mut out = Vec::new();
        self.log.retain(|event| match *event {
            PtlEvent::Arrived {
                inbound,
                match_bits,
                msg_len,
                flags,
                ..
            } => {
                out.push((inbound, match_bits, msg_len, flags));
                false
            }
            _ => true,
        });
        out
    }

    /// Matches every arrival into a zeroed buffer of the message's size.
    pub fn accept_all(&mut self) -> Vec<Landing> {
        self.take_arrivals()
            .into_iter()
            .map(|(inbound, match_bits, msg_len, flags)| {
                let dest = HostBuffer::zeroed(msg_len as usize);
                let done = self.ptl.matched(inbound, dest.clone(), 0).unwrap();
                Landing {
                    inbound,
                    match_bits,
                    flags,
                    dest,
                    done,
                }
            })
            .collect()
    }
}

/// Two processes on one subnet that know each other.
pub fn pair(config: PtlConfig) -> (SimNetwork, Proc, Proc) {
    let net = SimNetwork::new(SimConfig::default());
    let a = Proc::open(&net, 1, config.clone());
    let b = Proc::open(&net, 2, config);
    a.ptl.add_procs(&[b.info()]);
    b.ptl.add_procs(&[a.info()]);
    (net, a, b)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn pump(a: &mut Proc, b: &mut Proc, cycles: usize) {
    for _ in 0..cycles {
        a.ptl.progress();
        b.ptl.progress();
    }
    a.poll_events();
    b.poll_events();
}

/// Progresses both sides until `check` yields a value.
pub fn pump_until<T>(
    a: &mut Proc,
    b: &mut Proc,
    mut check: impl FnMut(&mut Proc, &mut Proc) -> Option<T>,
) -> T {
    for _ in 0..MAX_CYCLES {
        a.ptl.progress();
        b.ptl.progress();
        if let Some(value) = check(a, b) {
            return value;
        }
    }
    panic!("condition not reached after {} progress cycles", MAX_CYCLES);
}

/// Sends `data` from `from` to `to` eagerly and waits for both sides.
pub fn exchange(from: &mut Proc, to: &mut Proc, data: Vec<u8>) {
    let len = data.len();
    let (request, mut sent) = from
        .ptl
        .request_init(HostBuffer::from_vec(data), len, 0)
        .unwrap();
    from.ptl
        .send(to.name, request, 0, len, SendFlags::NONE)
        .unwrap();
    let mut landing = pump_until(from, to, |_, to| to.accept_all().pop());
    pump_until(from, to, |_, _| sent.try_take()).unwrap();
    pump_until(from, to, |_, _| landing.done.try_take()).unwrap();
    from.ptl.request_return(request).unwrap();
}

/// Connects the pair and leaves a registered send buffer on both sides.
pub fn warm_up(a: &mut Proc, b: &mut Proc) {
    exchange(a, b, pattern(256, 1));
    exchange(b, a, pattern(256, 2));
}

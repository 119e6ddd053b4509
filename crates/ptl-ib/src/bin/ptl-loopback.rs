#![warn(missing_docs)]

//! Loopback demo: two simulated processes exchange an eager and a
//! rendezvous message over the in-process fabric.

use std::sync::Arc;

use anyhow::{bail, Context};
use ptl_ib::{
    EndpointAddr, HostBuffer, ProcInfo, ProcName, PtlComponent, PtlConfig, PtlEvent, SendFlags,
    SimConfig, SimNetwork, Verbs,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MAX_CYCLES: usize = 1000;

struct Process {
    name: ProcName,
    addr: EndpointAddr,
    ptl: PtlComponent,
    events: UnboundedReceiver<PtlEvent>,
}

impl Process {
    fn open(net: &SimNetwork, rank: u32) -> anyhow::Result<Self> {
        let addr = EndpointAddr::new(0xfe80, rank + 1, 1);
        let device = net.attach(&format!("sim_{}", rank), addr);
        let ptl = PtlComponent::init(PtlConfig::default(), vec![device as Arc<dyn Verbs>])?;
        let events = ptl.events().context("event channel already taken")?;
        Ok(Self {
            name: ProcName::new(1, rank),
            addr,
            ptl,
            events,
        })
    }

    fn info(&self) -> ProcInfo {
        ProcInfo {
            name: self.name,
            endpoints: vec![self.addr],
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let net = SimNetwork::new(SimConfig::default());
    let sender = Process::open(&net, 0)?;
    let mut receiver = Process::open(&net, 1)?;
    sender.ptl.add_procs(&[receiver.info()]);
    receiver.ptl.add_procs(&[sender.info()]);

    for (label, size) in [("eager", 4 * 1024), ("rendezvous", 1 << 20)] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let (request, mut sent) =
            sender
                .ptl
                .request_init(HostBuffer::from_vec(payload.clone()), size, 42)?;
        sender
            .ptl
            .send(receiver.name, request, 0, size, SendFlags::NONE)?;

        let mut landing = None;
        let mut send_result = None;
        let mut recv_result = None;
        for _ in 0..MAX_CYCLES {
            sender.ptl.progress();
            receiver.ptl.progress();
            while let Ok(event) = receiver.events.try_recv() {
                if let PtlEvent::Arrived { inbound, msg_len, .. } = event {
                    let dest = HostBuffer::zeroed(msg_len as usize);
                    let done = receiver.ptl.matched(inbound, dest.clone(), 0)?;
                    landing = Some((dest, done));
                }
            }
            if send_result.is_none() {
                send_result = sent.try_take();
            }
            if recv_result.is_none() {
                if let Some((_, done)) = landing.as_mut() {
                    recv_result = done.try_take();
                }
            }
            if send_result.is_some() && recv_result.is_some() {
                break;
            }
        }

        let outcome = send_result.context("send did not complete")??;
        let received = recv_result.context("receive did not complete")??;
        let (dest, _) = landing.context("message never arrived")?;
        if dest.to_vec() != payload {
            bail!("{} payload corrupted", label);
        }
        info!(
            label,
            bytes = outcome.bytes,
            protocol = ?outcome.protocol,
            fragments = outcome.fragments,
            received = received.bytes,
            "message delivered"
        );
        sender.ptl.request_return(request)?;
    }

    info!(sender = ?sender.ptl.metrics(), receiver = ?receiver.ptl.metrics(), "loopback done");
    sender.ptl.finalize();
    receiver.ptl.finalize();
    Ok(())
}

#![warn(missing_docs)]

//! RDMA point-to-point transport: eager and rendezvous fragment engine,
//! memory registration cache, descriptor free lists and peer connection
//! management over a verbs interface.

pub mod component;
pub mod config;
pub mod error;
pub mod free_list;
pub mod header;
pub mod memory;
pub mod metrics;
pub mod peer;
mod progress;
mod recv;
pub mod registry;
pub mod request;
pub mod select;
mod send;
pub mod sim;
pub mod verbs;

pub use component::{ComponentStats, PtlComponent};
pub use config::{ConfigError, ControlParam, PtlConfig};
pub use error::{PtlError, PtlResult, VerbsError, VerbsResult};
pub use free_list::{DescriptorId, FreeList, FreeListConfig, FreeListError, FreeListStats, Reset};
pub use header::{FinHeader, FragHeader, FragKind, HeaderError, RemoteHandle};
pub use memory::HostBuffer;
pub use metrics::{PtlMetrics, PtlMetricsSnapshot};
pub use peer::{PeerState, ProcInfo, ProcName};
pub use registry::{MemRegistry, RegionHandle, RegionId, RegistryStats};
pub use request::{
    Completion, InboundId, Protocol, PtlEvent, RecvOutcome, RequestId, SendFlags, SendOutcome,
    SendStatus,
};
pub use select::{select_component, ComponentFactory, IbComponentFactory, Selected};
pub use sim::{CompletionOrder, FabricStats, SimConfig, SimDevice, SimNetwork};
pub use verbs::{AsyncEvent, EndpointAddr, Verbs, WorkCompletion};

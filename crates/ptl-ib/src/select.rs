//! Priority-based transport selection.
//!
//! Each candidate transport is offered through a [`ComponentFactory`]. With
//! a preferred name only that candidate is initialized; otherwise every
//! candidate is initialized and the one reporting the highest priority
//! wins. The losers are dropped, which finalizes them.

use std::cmp::Reverse;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::component::PtlComponent;
use crate::config::PtlConfig;
use crate::verbs::Verbs;

/// A transport that can be initialized on demand.
pub trait ComponentFactory {
    /// The initialized transport.
    type Component;

    /// Name used to prefer this candidate.
    fn name(&self) -> &str;

    /// Initializes the transport. `None` means it declines to run here.
    fn init(&self) -> Option<(Self::Component, i32)>;
}

/// Outcome of a selection.
#[derive(Debug)]
pub struct Selected<C> {
    /// Name of the winning factory.
    pub name: String,
    /// Reported priority.
    pub priority: i32,
    /// The initialized transport.
    pub component: C,
}

/// Picks a transport. Returns `None` if the preferred candidate is missing
/// or declines, or if no candidate initializes.
pub fn select_component<C>(
    factories: &[Box<dyn ComponentFactory<Component = C>>],
    preferred: Option<&str>,
) -> Option<Selected<C>> {
    if let Some(wanted) = preferred {
        let Some(factory) = factories.iter().find(|f| f.name() == wanted) else {
            warn!(preferred = wanted, "preferred transport not available");
            return None;
        };
        let (component, priority) = factory.init()?;
        info!(name = wanted, priority, "preferred transport selected");
        return Some(Selected {
            name: wanted.to_string(),
            priority,
            component,
        });
    }

    let mut ready: Vec<Selected<C>> = factories
        .iter()
        .filter_map(|f| match f.init() {
            Some((component, priority)) => {
                debug!(name = f.name(), priority, "transport available");
                Some(Selected {
                    name: f.name().to_string(),
                    priority,
                    component,
                })
            }
            None => {
                debug!(name = f.name(), "transport declined");
                None
            }
        })
        .collect();
    // ties go to the factory listed first
    let best = ready
        .iter()
        .enumerate()
        .max_by_key(|(idx, s)| (s.priority, Reverse(*idx)))
        .map(|(idx, _)| idx)?;
    let best = ready.swap_remove(best);
    info!(name = %best.name, priority = best.priority, others = ready.len(), "transport selected");
    Some(best)
}

/// Factory for the InfiniBand transport over a fixed set of interfaces.
pub struct IbComponentFactory {
    config: PtlConfig,
    devices: Vec<Arc<dyn Verbs>>,
}

impl IbComponentFactory {
    /// Creates a factory that opens `devices` with `config`.
    pub fn new(config: PtlConfig, devices: Vec<Arc<dyn Verbs>>) -> Self {
        Self { config, devices }
    }
}

impl ComponentFactory for IbComponentFactory {
    type Component = PtlComponent;

    fn name(&self) -> &str {
        "ib"
    }

    fn init(&self) -> Option<(PtlComponent, i32)> {
        let component = match PtlComponent::init(self.config.clone(), self.devices.clone()) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "ib transport declined");
                return None;
            }
        };
        let priority = component.priority();
        if priority <= 0 {
            debug!(priority, "ib transport disabled by priority");
            return None;
        }
        Some((component, priority))
    }
}

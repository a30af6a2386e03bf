//! Safety and liveness properties evaluated after every step.

use crate::link::check_link_pair;
use crate::network::SimNetwork;
use crate::PendingEventStore;
use pathcheck_core::{EventKind, NetEvent, NetEventKind, NodeService};
use pathcheck_types::{NodeIndex, Port};
use std::collections::BTreeMap;

/// Read-only view of the cluster handed to property checkers.
pub struct SystemView<'a> {
    pub services: &'a [Box<dyn NodeService>],
    pub network: &'a SimNetwork,
    pub events: &'a PendingEventStore,
}

impl<'a> SystemView<'a> {
    pub fn node_count(&self) -> u32 {
        self.services.len() as u32
    }

    /// `node`'s service as its concrete type.
    pub fn service<T: 'static>(&self, node: NodeIndex) -> Option<&'a T> {
        self.services
            .get(node as usize)
            .and_then(|s| s.as_any().downcast_ref::<T>())
    }

    /// Every service of concrete type `T`, in node order.
    pub fn services_of<T: 'static>(&self) -> impl Iterator<Item = &'a T> + 'a {
        self.services
            .iter()
            .filter_map(|s| s.as_any().downcast_ref::<T>())
    }
}

/// A property that must hold after every step.
pub trait SafetyProperty {
    fn name(&self) -> &str;

    /// `Err` describes the violation.
    fn check(&self, view: &SystemView<'_>) -> Result<(), String>;
}

/// A property the cluster should eventually reach.
pub trait LivenessProperty {
    fn name(&self) -> &str;

    fn is_live(&self, view: &SystemView<'_>) -> bool;
}

/// Both sides of every stream link on a port are in a legal combination.
#[derive(Debug, Clone, Copy)]
pub struct SocketStateProperty {
    port: Port,
}

impl SocketStateProperty {
    pub fn new(port: Port) -> Self {
        Self { port }
    }
}

impl SafetyProperty for SocketStateProperty {
    fn name(&self) -> &str {
        "socket state"
    }

    fn check(&self, view: &SystemView<'_>) -> Result<(), String> {
        for (i, j, a, b) in view.network.link_pairs(self.port) {
            check_link_pair(a, b).map_err(|e| format!("port {} link {i}<->{j}: {e}", self.port))?;
        }
        Ok(())
    }
}

/// At most one pending delivery event per (source, destination, port).
///
/// Only meaningful when model checking; timed runs key one event per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleDeliveryProperty;

impl SafetyProperty for SingleDeliveryProperty {
    fn name(&self) -> &str {
        "single pending delivery"
    }

    fn check(&self, view: &SystemView<'_>) -> Result<(), String> {
        let mut counts: BTreeMap<(NodeIndex, NodeIndex, Port), usize> = BTreeMap::new();
        for (_, event) in view.events.iter() {
            if let EventKind::Network(NetEvent {
                kind: NetEventKind::Message,
                peer,
                port,
            }) = event.kind
            {
                *counts.entry((peer, event.node, port)).or_default() += 1;
            }
        }
        match counts.into_iter().find(|(_, n)| *n > 1) {
            Some(((src, dest, port), n)) => Err(format!(
                "{n} delivery events pending from {src} to {dest} on port {port}"
            )),
            None => Ok(()),
        }
    }
}

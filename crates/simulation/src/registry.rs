//! Named providers of services under test.
//!
//! A [`CheckedService`] builds one service instance per node together with
//! the transports those services bind and the properties checked against
//! them. The runner reloads the test at the start of every path, so each
//! path starts from freshly constructed services.

use crate::properties::{
    LivenessProperty, SafetyProperty, SingleDeliveryProperty, SocketStateProperty,
};
use crate::transport::TransportKind;
use crate::{SimulationError, SimulationMode, SimulationParams};
use indexmap::IndexMap;
use pathcheck_core::NodeService;
use pathcheck_types::Port;
use std::sync::Arc;
use tracing::debug;

/// Everything a test contributes to one path.
pub struct LoadedTest {
    /// One service per node, in node order.
    pub services: Vec<Box<dyn NodeService>>,
    /// Transports bound on every node.
    pub bindings: Vec<(Port, TransportKind)>,
    pub safety: Vec<Box<dyn SafetyProperty>>,
    pub liveness: Vec<Box<dyn LivenessProperty>>,
}

impl LoadedTest {
    pub fn new(services: Vec<Box<dyn NodeService>>) -> Self {
        Self {
            services,
            bindings: Vec::new(),
            safety: Vec::new(),
            liveness: Vec::new(),
        }
    }

    /// Bind a transport of `kind` at `port` on every node.
    pub fn with_binding(mut self, port: Port, kind: TransportKind) -> Self {
        self.bindings.push((port, kind));
        self
    }

    pub fn with_safety(mut self, property: impl SafetyProperty + 'static) -> Self {
        self.safety.push(Box::new(property));
        self
    }

    pub fn with_liveness(mut self, property: impl LivenessProperty + 'static) -> Self {
        self.liveness.push(Box::new(property));
        self
    }

    /// Add the checks every run carries: link-state symmetry on each stream
    /// port, and a single pending delivery per link when model checking.
    fn with_builtin_properties(mut self, mode: SimulationMode) -> Self {
        let stream_ports: Vec<Port> = self
            .bindings
            .iter()
            .filter(|(_, kind)| *kind == TransportKind::Stream)
            .map(|(port, _)| *port)
            .collect();
        for port in stream_ports {
            self.safety.push(Box::new(SocketStateProperty::new(port)));
        }
        if mode == SimulationMode::ModelCheck {
            self.safety.push(Box::new(SingleDeliveryProperty));
        }
        self
    }
}

/// A protocol under test, looked up by name.
pub trait CheckedService: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// One-line description for `--list`.
    fn description(&self) -> &str {
        ""
    }

    /// Build the services of a `node_count`-node cluster.
    fn load_test(
        &self,
        node_count: u32,
        params: &SimulationParams,
    ) -> Result<LoadedTest, SimulationError>;
}

type LoadFn = dyn Fn(u32, &SimulationParams) -> Result<LoadedTest, SimulationError> + Send + Sync;

/// A [`CheckedService`] backed by a closure.
pub struct FnService {
    name: String,
    description: String,
    load: Box<LoadFn>,
}

impl FnService {
    pub fn new<F>(name: impl Into<String>, load: F) -> Self
    where
        F: Fn(u32, &SimulationParams) -> Result<LoadedTest, SimulationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            load: Box::new(load),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl CheckedService for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn load_test(
        &self,
        node_count: u32,
        params: &SimulationParams,
    ) -> Result<LoadedTest, SimulationError> {
        (self.load)(node_count, params)
    }
}

/// Name to provider map, in registration order.
#[derive(Clone, Default)]
pub struct TestRegistry {
    tests: IndexMap<String, Arc<dyn CheckedService>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under its name, replacing any earlier entry.
    pub fn register(&mut self, service: impl CheckedService + 'static) {
        let name = service.name().to_string();
        debug!(test = %name, "registering checked service");
        self.tests.insert(name, Arc::new(service));
    }

    pub fn with(mut self, service: impl CheckedService + 'static) -> Self {
        self.register(service);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CheckedService>, SimulationError> {
        self.tests
            .get(name)
            .cloned()
            .ok_or_else(|| SimulationError::UnknownTest(name.to_string()))
    }

    /// Registered names with their descriptions.
    pub fn names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tests
            .iter()
            .map(|(name, service)| (name.as_str(), service.description()))
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Load `service` for `node_count` nodes, check its shape and add the
/// built-in properties.
pub fn load(
    service: &dyn CheckedService,
    node_count: u32,
    params: &SimulationParams,
) -> Result<LoadedTest, SimulationError> {
    let test = service.load_test(node_count, params)?;
    if test.services.len() != node_count as usize {
        return Err(SimulationError::InvalidParams(format!(
            "test {} built {} services for {} nodes",
            service.name(),
            test.services.len(),
            node_count
        )));
    }
    let mut ports: Vec<Port> = test.bindings.iter().map(|(port, _)| *port).collect();
    ports.sort_unstable();
    if ports.windows(2).any(|w| w[0] == w[1]) {
        return Err(SimulationError::InvalidParams(format!(
            "test {} binds a port twice",
            service.name()
        )));
    }
    Ok(test.with_builtin_properties(params.mode))
}

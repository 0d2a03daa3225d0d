//! Protocol lifecycle management
//!
//! Attaches one routing protocol instance to each node of a network stack
//! and drives start/stop/teardown for them.

use crate::error::{Result, RoutingError};
use crate::protocol::{PoissonReverseProtocol, ProtocolConfig, ProtocolState, RoutingProtocol};
use crate::scheduler::UpdateScheduler;
use crate::stack::NetworkStack;
use crate::table::RouteEntry;
use crate::types::{Address, InterfaceId, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the routing protocol instance of every node
pub struct RoutingManager {
    stack: Arc<dyn NetworkStack>,
    scheduler: Arc<dyn UpdateScheduler>,
    instances: DashMap<NodeId, Arc<dyn RoutingProtocol>>,
}

impl RoutingManager {
    pub fn new(stack: Arc<dyn NetworkStack>, scheduler: Arc<dyn UpdateScheduler>) -> Self {
        RoutingManager {
            stack,
            scheduler,
            instances: DashMap::new(),
        }
    }

    /// Enable the Poisson-reverse protocol on `node`
    ///
    /// The configuration is validated here, before anything is started.
    pub fn enable(&self, node: NodeId, config: ProtocolConfig) -> Result<()> {
        match self.instances.entry(node) {
            Entry::Occupied(_) => Err(RoutingError::AlreadyEnabled(node)),
            Entry::Vacant(slot) => {
                let protocol = PoissonReverseProtocol::new(
                    node,
                    config,
                    Arc::clone(&self.stack),
                    Arc::clone(&self.scheduler),
                )?;
                slot.insert(Arc::new(protocol));
                Ok(())
            }
        }
    }

    /// Attach an already constructed protocol instance
    pub fn attach(&self, protocol: Arc<dyn RoutingProtocol>) -> Result<()> {
        let node = protocol.node_id();
        match self.instances.entry(node) {
            Entry::Occupied(_) => Err(RoutingError::AlreadyEnabled(node)),
            Entry::Vacant(slot) => {
                slot.insert(protocol);
                Ok(())
            }
        }
    }

    /// Protocol instance of `node`
    pub fn instance(&self, node: NodeId) -> Result<Arc<dyn RoutingProtocol>> {
        self.instances
            .get(&node)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RoutingError::NodeNotFound(node))
    }

    /// Nodes with routing enabled, ascending
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.instances.iter().map(|entry| *entry.key()).collect();
        nodes.sort();
        nodes
    }

    pub fn start(&self, node: NodeId) -> Result<()> {
        self.instance(node)?.start()
    }

    pub fn stop(&self, node: NodeId) -> Result<()> {
        self.instance(node)?.stop();
        Ok(())
    }

    /// Start every instance that has not been started yet
    ///
    /// Returns the nodes that failed to start along with the reason; the
    /// remaining nodes are started regardless.
    pub fn start_all(&self) -> Vec<(NodeId, RoutingError)> {
        let mut failures = Vec::new();

        for node in self.nodes() {
            let Ok(instance) = self.instance(node) else {
                continue;
            };
            if instance.state() != ProtocolState::Uninitialized {
                continue;
            }
            if let Err(e) = instance.start() {
                warn!("Node {}: routing failed to start: {}", node, e);
                failures.push((node, e));
            }
        }

        info!(
            "Started routing on {} of {} nodes",
            self.running_count(),
            self.instances.len()
        );
        failures
    }

    pub fn stop_all(&self) {
        for node in self.nodes() {
            if let Ok(instance) = self.instance(node) {
                instance.stop();
            }
        }
    }

    /// Stop and detach the instance of `node`
    pub fn disable(&self, node: NodeId) -> Result<()> {
        let (_, instance) = self
            .instances
            .remove(&node)
            .ok_or(RoutingError::NodeNotFound(node))?;
        instance.stop();
        Ok(())
    }

    pub fn notify_interface_up(&self, node: NodeId, interface: InterfaceId) -> Result<()> {
        self.instance(node)?.notify_interface_up(interface);
        Ok(())
    }

    pub fn notify_interface_down(&self, node: NodeId, interface: InterfaceId) -> Result<()> {
        self.instance(node)?.notify_interface_down(interface);
        Ok(())
    }

    pub fn lookup(&self, node: NodeId, destination: &Address) -> Result<Option<RouteEntry>> {
        Ok(self.instance(node)?.lookup(destination))
    }

    /// Route listing of one node
    pub fn dump_table(&self, node: NodeId) -> Result<String> {
        Ok(self.instance(node)?.dump_table())
    }

    /// Route listings of every node, in node order
    pub fn dump_all(&self) -> String {
        self.nodes()
            .into_iter()
            .filter_map(|node| self.dump_table(node).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn state(&self, node: NodeId) -> Result<ProtocolState> {
        Ok(self.instance(node)?.state())
    }

    fn running_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.value().state() == ProtocolState::Running)
            .count()
    }
}

impl Drop for RoutingManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

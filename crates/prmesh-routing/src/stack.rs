//! Network stack collaborator
//!
//! The protocol reads interface information from, and pushes route
//! installs/withdrawals into, whatever owns the node's network layer.
//! `InMemoryStack` is a self-contained implementation with named network
//! segments, used by the simulation driver and tests.

use crate::error::{Result, RoutingError};
use crate::table::RouteEntry;
use crate::types::{Address, Interface, InterfaceId, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Network layer operations the routing core depends on
pub trait NetworkStack: Send + Sync {
    /// Every interface `node` currently knows about, its own included
    fn interfaces(&self, node: NodeId) -> Result<Vec<Interface>>;

    /// Install or replace a forwarding entry
    fn install_route(&self, node: NodeId, entry: &RouteEntry) -> Result<()>;

    /// Withdraw the forwarding entry for `destination`
    fn remove_route(&self, node: NodeId, destination: Address) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Attachment {
    interface: Interface,
    segment: Option<String>,
}

#[derive(Debug, Default)]
struct StackState {
    next_interface: u32,
    nodes: BTreeSet<NodeId>,
    interfaces: BTreeMap<InterfaceId, Attachment>,
    routes: BTreeMap<NodeId, BTreeMap<Address, RouteEntry>>,
}

impl StackState {
    fn allocate_interface(&mut self) -> InterfaceId {
        let id = InterfaceId::new(self.next_interface);
        self.next_interface += 1;
        id
    }

    fn segments_of(&self, node: NodeId) -> BTreeSet<&str> {
        self.interfaces
            .values()
            .filter(|a| a.interface.node == node)
            .filter_map(|a| a.segment.as_deref())
            .collect()
    }
}

/// In-process network stack with per-node static routes
#[derive(Debug, Default)]
pub struct InMemoryStack {
    state: RwLock<StackState>,
}

impl InMemoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StackState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StackState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Known nodes in ascending order
    pub fn nodes(&self) -> Vec<NodeId> {
        self.read().nodes.iter().copied().collect()
    }

    /// Give `node` a loopback interface
    pub fn add_loopback(&self, node: NodeId) -> InterfaceId {
        let mut state = self.write();
        state.nodes.insert(node);
        let id = state.allocate_interface();
        state.interfaces.insert(
            id,
            Attachment {
                interface: Interface {
                    id,
                    node,
                    address: Address::LOOPBACK,
                    up: true,
                    loopback: true,
                },
                segment: None,
            },
        );
        id
    }

    /// Attach `node` to `segment` with `address`
    pub fn attach(&self, node: NodeId, address: Address, segment: &str) -> Result<InterfaceId> {
        let mut state = self.write();

        if let Some(existing) = state
            .interfaces
            .values()
            .find(|a| a.segment.as_deref() == Some(segment) && a.interface.address == address)
        {
            return Err(RoutingError::Stack(format!(
                "address {} already assigned on {} (interface {})",
                address, segment, existing.interface.id
            )));
        }

        state.nodes.insert(node);
        let id = state.allocate_interface();
        state.interfaces.insert(
            id,
            Attachment {
                interface: Interface {
                    id,
                    node,
                    address,
                    up: true,
                    loopback: false,
                },
                segment: Some(segment.to_string()),
            },
        );
        debug!("Node {}: interface {} up at {} on {}", node, id, address, segment);

        Ok(id)
    }

    /// Connect two nodes over a point-to-point segment
    ///
    /// Addresses are assigned from `base` as a /30: `a` gets `base + 1`,
    /// `b` gets `base + 2`.
    pub fn connect_point_to_point(
        &self,
        a: NodeId,
        b: NodeId,
        base: Address,
    ) -> Result<(InterfaceId, InterfaceId)> {
        let segment = format!("p2p-{}", base);
        let first = self.attach(a, base.offset(1), &segment)?;
        let second = self.attach(b, base.offset(2), &segment)?;
        Ok((first, second))
    }

    /// Change an interface's liveness
    pub fn set_interface_up(&self, id: InterfaceId, up: bool) -> Result<()> {
        let mut state = self.write();
        let attachment = state
            .interfaces
            .get_mut(&id)
            .ok_or_else(|| RoutingError::InterfaceNotFound(id.to_string()))?;
        attachment.interface.up = up;
        debug!(
            "Node {}: interface {} {}",
            attachment.interface.node,
            id,
            if up { "up" } else { "down" }
        );
        Ok(())
    }

    pub fn interface(&self, id: InterfaceId) -> Option<Interface> {
        self.read().interfaces.get(&id).map(|a| a.interface.clone())
    }

    /// Forwarding entries installed on `node`, ordered by destination
    pub fn installed_routes(&self, node: NodeId) -> Vec<RouteEntry> {
        self.read()
            .routes
            .get(&node)
            .map(|routes| routes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn installed_route(&self, node: NodeId, destination: Address) -> Option<RouteEntry> {
        self.read()
            .routes
            .get(&node)
            .and_then(|routes| routes.get(&destination).cloned())
    }
}

impl NetworkStack for InMemoryStack {
    fn interfaces(&self, node: NodeId) -> Result<Vec<Interface>> {
        let state = self.read();
        if !state.nodes.contains(&node) {
            return Err(RoutingError::NodeNotFound(node));
        }

        let segments = state.segments_of(node);
        Ok(state
            .interfaces
            .values()
            .filter(|a| {
                a.interface.node == node
                    || a.segment
                        .as_deref()
                        .map_or(false, |segment| segments.contains(segment))
            })
            .map(|a| a.interface.clone())
            .collect())
    }

    fn install_route(&self, node: NodeId, entry: &RouteEntry) -> Result<()> {
        let mut state = self.write();
        if !state.nodes.contains(&node) {
            return Err(RoutingError::NodeNotFound(node));
        }
        state
            .routes
            .entry(node)
            .or_default()
            .insert(entry.destination, entry.clone());
        Ok(())
    }

    fn remove_route(&self, node: NodeId, destination: Address) -> Result<()> {
        let mut state = self.write();
        if !state.nodes.contains(&node) {
            return Err(RoutingError::NodeNotFound(node));
        }
        if let Some(routes) = state.routes.get_mut(&node) {
            routes.remove(&destination);
        }
        Ok(())
    }
}

use anyhow::{anyhow, Context, Result};
use prmesh_routing::{Address, InMemoryStack, InterfaceId, NodeId};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::TopologyConfig;

/// Simulated network built from configuration
pub struct Topology {
    stack: Arc<InMemoryStack>,
    nodes: Vec<NodeId>,
    /// Non-loopback interfaces per node, in creation order
    interfaces: BTreeMap<NodeId, Vec<InterfaceId>>,
}

impl Topology {
    /// Create nodes with loopbacks, then wire links and shared segments
    pub fn build(config: &TopologyConfig) -> Result<Self> {
        let stack = Arc::new(InMemoryStack::new());
        let nodes: Vec<NodeId> = (0..config.nodes).map(NodeId::new).collect();
        let mut interfaces: BTreeMap<NodeId, Vec<InterfaceId>> = BTreeMap::new();

        for &node in &nodes {
            stack.add_loopback(node);
            interfaces.insert(node, Vec::new());
        }

        for (index, link) in config.links.iter().enumerate() {
            let base = match link.subnet {
                Some(subnet) => Address::from(subnet),
                None => default_link_subnet(index),
            };
            let (a, b) = (NodeId::new(link.a), NodeId::new(link.b));
            let (first, second) = stack
                .connect_point_to_point(a, b, base)
                .with_context(|| format!("Failed to create link {} ({} <-> {})", index, a, b))?;

            interfaces.entry(a).or_default().push(first);
            interfaces.entry(b).or_default().push(second);
            debug!("Link {}: node {} <-> node {} on {}/30", index, a, b, base);
        }

        for lan in &config.lans {
            let base = Address::from(lan.subnet);
            for (host, &node) in lan.nodes.iter().enumerate() {
                let node = NodeId::new(node);
                let address = base.offset(host as u32 + 1);
                let id = stack
                    .attach(node, address, &lan.name)
                    .with_context(|| format!("Failed to attach node {} to {}", node, lan.name))?;
                interfaces.entry(node).or_default().push(id);
            }
            debug!("Segment {}: {} nodes on {}", lan.name, lan.nodes.len(), base);
        }

        info!(
            "Built topology: {} nodes, {} links, {} shared segments",
            nodes.len(),
            config.links.len(),
            config.lans.len()
        );

        Ok(Self {
            stack,
            nodes,
            interfaces,
        })
    }

    pub fn stack(&self) -> Arc<InMemoryStack> {
        Arc::clone(&self.stack)
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// The `index`-th non-loopback interface of `node`
    pub fn interface(&self, node: NodeId, index: usize) -> Result<InterfaceId> {
        self.interfaces
            .get(&node)
            .and_then(|ids| ids.get(index).copied())
            .ok_or_else(|| anyhow!("node {} has no interface #{}", node, index))
    }
}

/// 10.1.<index + 1>.0, carrying into the second octet past 255 links
fn default_link_subnet(index: usize) -> Address {
    Address::from(Ipv4Addr::new(10, 1, 0, 0)).offset(((index as u32) + 1) << 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LanConfig, LinkConfig};
    use prmesh_routing::NetworkStack;

    #[test]
    fn test_default_topology() {
        let topology = Topology::build(&TopologyConfig::default()).unwrap();
        assert_eq!(topology.nodes().len(), 2);

        let a = topology.interface(NodeId::new(0), 0).unwrap();
        let b = topology.interface(NodeId::new(1), 0).unwrap();
        let stack = topology.stack();
        assert_eq!(
            stack.interface(a).unwrap().address,
            "10.1.1.1".parse::<Address>().unwrap()
        );
        assert_eq!(
            stack.interface(b).unwrap().address,
            "10.1.1.2".parse::<Address>().unwrap()
        );

        // Each node sees its loopback, its own end and the peer's end
        assert_eq!(stack.interfaces(NodeId::new(0)).unwrap().len(), 3);
    }

    #[test]
    fn test_auto_subnets() {
        assert_eq!(default_link_subnet(0).to_string(), "10.1.1.0");
        assert_eq!(default_link_subnet(4).to_string(), "10.1.5.0");

        let config = TopologyConfig {
            nodes: 3,
            links: vec![
                LinkConfig {
                    a: 0,
                    b: 1,
                    subnet: None,
                },
                LinkConfig {
                    a: 1,
                    b: 2,
                    subnet: None,
                },
            ],
            lans: Vec::new(),
        };
        let topology = Topology::build(&config).unwrap();

        let middle = NodeId::new(1);
        let second = topology.interface(middle, 1).unwrap();
        assert_eq!(
            topology.stack().interface(second).unwrap().address.to_string(),
            "10.1.2.1"
        );
        assert!(topology.interface(middle, 2).is_err());
    }

    #[test]
    fn test_lan_addresses() {
        let config = TopologyConfig {
            nodes: 3,
            links: Vec::new(),
            lans: vec![LanConfig {
                name: "lan0".to_string(),
                subnet: Ipv4Addr::new(192, 168, 0, 0),
                nodes: vec![0, 1, 2],
            }],
        };
        let topology = Topology::build(&config).unwrap();

        let addresses: Vec<String> = topology
            .nodes()
            .iter()
            .map(|&n| {
                let id = topology.interface(n, 0).unwrap();
                topology.stack().interface(id).unwrap().address.to_string()
            })
            .collect();
        assert_eq!(addresses, ["192.168.0.1", "192.168.0.2", "192.168.0.3"]);
    }

    #[test]
    fn test_duplicate_subnet_rejected() {
        let config = TopologyConfig {
            nodes: 2,
            links: vec![
                LinkConfig {
                    a: 0,
                    b: 1,
                    subnet: Some(Ipv4Addr::new(10, 9, 9, 0)),
                },
                LinkConfig {
                    a: 0,
                    b: 1,
                    subnet: Some(Ipv4Addr::new(10, 9, 9, 0)),
                },
            ],
            lans: Vec::new(),
        };
        assert!(Topology::build(&config).is_err());
    }
}

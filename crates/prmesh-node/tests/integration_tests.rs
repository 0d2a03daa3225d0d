/**
 * Integration Tests for the simulation host
 *
 * These tests drive complete runs through the public API:
 * - Configuration file round trips
 * - Virtual-clock runs over point-to-point and shared topologies
 * - Scheduled link failures and recoveries
 * - Realtime runs on a paused tokio clock
 */
use prmesh_node::config::{Config, LanConfig, LinkConfig, LinkEvent, SimulationMode};
use prmesh_node::Simulation;
use prmesh_routing::{NodeId, ProtocolState, RoutingError};
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::TempDir;

fn lan_config(nodes: u32, cost_parameter: f64) -> Config {
    let mut config = Config::default();
    config.routing.cost_parameter = cost_parameter;
    config.topology.nodes = nodes;
    config.topology.links.clear();
    config.topology.lans.push(LanConfig {
        name: "lan0".to_string(),
        subnet: Ipv4Addr::new(10, 0, 0, 0),
        nodes: (0..nodes).collect(),
    });
    config
}

fn link_event(at_secs: f64, node: u32, up: bool) -> LinkEvent {
    LinkEvent {
        at_secs,
        node,
        interface: 0,
        up,
    }
}

// =====================
// Configuration Tests
// =====================

#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prnode").join("config.yaml");

    let created = Config::create_default(Some(path.clone())).unwrap();
    assert!(path.exists());

    let loaded = Config::load(Some(path.clone())).unwrap();
    assert_eq!(loaded, created);
    assert_eq!(loaded.config_path(), path.as_path());
}

#[test]
fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let result = Config::load(Some(dir.path().join("absent.yaml")));
    assert!(result.is_err());
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");

    let mut config = Config::default();
    config.routing.cost_parameter = -1.0;
    std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

    assert!(Config::load(Some(path)).is_err());
}

// =====================
// Virtual Clock Runs
// =====================

#[test]
fn test_lan_costs_saturate() {
    // Neighbours are at most 3 apart, so a mean of 5 always succeeds
    let simulation = Simulation::new(lan_config(4, 5.0)).unwrap();
    let report = simulation.run_virtual().unwrap();

    assert!(report.start_failures.is_empty());
    for node in &report.nodes {
        assert_eq!(node.routes.len(), 3);
        let own = simulation.topology().interface(node.node, 0).unwrap();
        let own = simulation.topology().stack().interface(own).unwrap();

        for route in &node.routes {
            assert_eq!(route.cost, 100.0);
            assert_eq!(route.next_hop, own.address);
            assert_eq!(route.out_interface, own.id);
            assert_ne!(route.destination, own.address);
        }
    }
}

#[test]
fn test_zero_cost_parameter() {
    let simulation = Simulation::new(lan_config(3, 0.0)).unwrap();
    let report = simulation.run_virtual().unwrap();

    for node in &report.nodes {
        assert_eq!(node.routes.len(), 2);
        assert!(node.routes.iter().all(|r| r.cost == 0.0));
    }
}

#[test]
fn test_seeded_runs_reproduce() {
    let mut config = Config::default();
    config.routing.cost_parameter = 0.5;
    config.routing.seed = Some(42);

    let first = Simulation::new(config.clone()).unwrap().run_virtual().unwrap();
    let second = Simulation::new(config).unwrap().run_virtual().unwrap();

    for (a, b) in first.nodes.iter().zip(&second.nodes) {
        assert_eq!(a.routes, b.routes);
    }
}

#[test]
fn test_link_failure_withdraws_routes() {
    let mut config = Config::default();
    config.simulation.link_events.push(link_event(5.0, 1, false));

    let report = Simulation::new(config).unwrap().run_virtual().unwrap();

    for node in &report.nodes {
        assert!(node.routes.is_empty(), "node {} kept routes", node.node);
        assert_eq!(node.stats.routes_withdrawn, 1);
    }
}

#[test]
fn test_link_recovery_reinstalls_routes() {
    let mut config = Config::default();
    config.simulation.link_events.push(link_event(5.0, 1, false));
    config.simulation.link_events.push(link_event(15.0, 1, true));

    let report = Simulation::new(config).unwrap().run_virtual().unwrap();

    for node in &report.nodes {
        assert_eq!(node.routes.len(), 1);
        assert_eq!(node.stats.routes_installed, 2);
    }
}

#[test]
fn test_isolated_node_fails_to_start() {
    let mut config = Config::default();
    config.topology.nodes = 3;

    let report = Simulation::new(config).unwrap().run_virtual().unwrap();

    assert_eq!(report.start_failures.len(), 1);
    let (node, error) = &report.start_failures[0];
    assert_eq!(*node, NodeId::new(2));
    assert_eq!(*error, RoutingError::NoPrimaryInterface(NodeId::new(2)));

    let isolated = report.node(NodeId::new(2)).unwrap();
    assert_eq!(isolated.state, ProtocolState::Uninitialized);
    assert!(isolated.routes.is_empty());

    // The others run regardless
    let linked = report.node(NodeId::new(0)).unwrap();
    assert_eq!(linked.state, ProtocolState::Running);
    assert_eq!(linked.routes.len(), 1);
}

#[test]
fn test_chain_routes_use_bound_interface() {
    let mut config = Config::default();
    config.topology.nodes = 3;
    config.topology.links = vec![
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
    ];

    let report = Simulation::new(config).unwrap().run_virtual().unwrap();

    // Node 0 binds 10.1.1.1 and only sees its own segment
    let edge = report.node(NodeId::new(0)).unwrap();
    assert_eq!(edge.routes.len(), 1);
    assert_eq!(edge.routes[0].destination.to_string(), "10.1.1.2");

    // Node 1 sees both segments and routes everything out of its first one
    let middle = report.node(NodeId::new(1)).unwrap();
    let destinations: Vec<String> = middle
        .routes
        .iter()
        .map(|r| r.destination.to_string())
        .collect();
    assert!(destinations.contains(&"10.1.1.1".to_string()));
    assert!(destinations.contains(&"10.1.2.2".to_string()));
    assert!(!destinations.contains(&"10.1.1.2".to_string()));
    assert!(middle
        .routes
        .iter()
        .all(|r| r.next_hop.to_string() == "10.1.1.2"));
}

// =====================
// Realtime Runs
// =====================

#[tokio::test(start_paused = true)]
async fn test_realtime_run() {
    let mut config = Config::default();
    config.simulation.mode = SimulationMode::Realtime;
    config.simulation.duration_secs = 25.0;

    let simulation = Simulation::new(config).unwrap();
    let report = simulation.run().await.unwrap();

    assert_eq!(report.mode, SimulationMode::Realtime);
    assert!(report.elapsed >= Duration::from_secs(25));
    for node in &report.nodes {
        assert_eq!(node.stats.cycles_run, 3);
        assert_eq!(node.routes.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_realtime_link_failure() {
    let mut config = Config::default();
    config.simulation.mode = SimulationMode::Realtime;
    config.simulation.duration_secs = 15.0;
    config.simulation.link_events.push(link_event(5.0, 0, false));

    let report = Simulation::new(config).unwrap().run().await.unwrap();

    for node in &report.nodes {
        assert!(node.routes.is_empty());
    }
}

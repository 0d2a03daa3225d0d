use anyhow::Result;
use prmesh_routing::{
    InMemoryStack, InterfaceId, NodeId, ProtocolState, ProtocolStats, RouteEntry, RoutingError,
    RoutingManager, RoutingProtocol, TokioScheduler, UpdateScheduler, VirtualScheduler,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::signal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, SimulationMode};
use crate::monitor::TablePrinter;
use crate::topology::Topology;

/// Final state of one node's routing instance
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: NodeId,
    pub state: ProtocolState,
    pub routes: Vec<RouteEntry>,
    pub table: String,
    pub stats: ProtocolStats,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub mode: SimulationMode,
    pub elapsed: Duration,
    pub nodes: Vec<NodeReport>,
    pub start_failures: Vec<(NodeId, RoutingError)>,
}

impl SimulationReport {
    pub fn node(&self, node: NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|report| report.node == node)
    }

    /// Every node's table, in node order
    pub fn tables(&self) -> String {
        self.nodes
            .iter()
            .map(|report| report.table.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A link state change resolved against the topology
#[derive(Debug, Clone, Copy)]
struct ScheduledLinkEvent {
    at: Duration,
    node: NodeId,
    interface: InterfaceId,
    up: bool,
}

/// Runs the routing protocol on every node of a configured topology
pub struct Simulation {
    config: Config,
    topology: Topology,
}

impl Simulation {
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing simulation...");

        config.validate()?;
        let topology = Topology::build(&config.topology)?;

        Ok(Self { config, topology })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn run(&self) -> Result<SimulationReport> {
        match self.config.simulation.mode {
            SimulationMode::Virtual => self.run_virtual(),
            SimulationMode::Realtime => self.run_realtime().await,
        }
    }

    /// Run on a virtual clock, as fast as the host allows
    pub fn run_virtual(&self) -> Result<SimulationReport> {
        let duration = self.config.simulation.duration()?;
        let events = self.link_events()?;

        let scheduler = Arc::new(VirtualScheduler::new());
        let manager = Arc::new(RoutingManager::new(self.topology.stack(), scheduler.clone()));
        self.enable_all(&manager)?;

        // Link events go in before the protocol timers so a change due at
        // the same instant as an update is visible to that update
        for event in events {
            let stack = self.topology.stack();
            let manager = Arc::downgrade(&manager);
            scheduler.schedule(
                event.at,
                Box::new(move || fire_link_event(&stack, &manager, event)),
            )?;
        }

        info!("Starting routing on {} nodes (virtual clock)", self.topology.nodes().len());
        let start_failures = manager.start_all();

        if let Some(period) = self.config.simulation.print_interval()? {
            arm_virtual_printer(&scheduler, Arc::downgrade(&manager), period)?;
        }

        let fired = scheduler.run_until(duration);
        debug!("Virtual clock reached {:?} after {} timer events", scheduler.now(), fired);

        let report = self.collect(
            &manager,
            SimulationMode::Virtual,
            scheduler.now(),
            start_failures,
        );
        manager.stop_all();

        Ok(report)
    }

    /// Run on the tokio clock until the duration elapses or Ctrl+C
    pub async fn run_realtime(&self) -> Result<SimulationReport> {
        let duration = self.config.simulation.duration()?;
        let events = self.link_events()?;

        let scheduler = Arc::new(TokioScheduler::new());
        let manager = Arc::new(RoutingManager::new(self.topology.stack(), scheduler));
        self.enable_all(&manager)?;

        let started = Instant::now();
        info!("Starting routing on {} nodes (realtime)", self.topology.nodes().len());
        let start_failures = manager.start_all();

        let mut event_tasks = Vec::with_capacity(events.len());
        for event in events {
            let stack = self.topology.stack();
            let manager = Arc::downgrade(&manager);
            event_tasks.push(tokio::spawn(async move {
                tokio::time::sleep_until(started + event.at).await;
                fire_link_event(&stack, &manager, event);
            }));
        }

        let mut printer = match self.config.simulation.print_interval()? {
            Some(period) => {
                let mut printer = TablePrinter::new(&manager, period);
                printer.start().await?;
                Some(printer)
            }
            None => None,
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                info!("Simulation time elapsed");
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
        }

        if let Some(printer) = printer.as_mut() {
            printer.stop().await?;
        }
        for task in event_tasks {
            task.abort();
        }

        let report = self.collect(
            &manager,
            SimulationMode::Realtime,
            started.elapsed(),
            start_failures,
        );
        manager.stop_all();

        Ok(report)
    }

    fn enable_all(&self, manager: &RoutingManager) -> Result<()> {
        let protocol = self.config.routing.protocol_config()?;
        for &node in self.topology.nodes() {
            manager.enable(node, protocol.clone())?;
        }
        Ok(())
    }

    fn link_events(&self) -> Result<Vec<ScheduledLinkEvent>> {
        self.config
            .simulation
            .link_events
            .iter()
            .map(|event| -> Result<ScheduledLinkEvent> {
                let node = NodeId::new(event.node);
                Ok(ScheduledLinkEvent {
                    at: event.at()?,
                    node,
                    interface: self.topology.interface(node, event.interface)?,
                    up: event.up,
                })
            })
            .collect()
    }

    fn collect(
        &self,
        manager: &RoutingManager,
        mode: SimulationMode,
        elapsed: Duration,
        start_failures: Vec<(NodeId, RoutingError)>,
    ) -> SimulationReport {
        let nodes = manager
            .nodes()
            .into_iter()
            .filter_map(|node| {
                let instance = manager.instance(node).ok()?;
                Some(NodeReport {
                    node,
                    state: instance.state(),
                    routes: instance.routes(),
                    table: instance.dump_table(),
                    stats: instance.stats(),
                })
            })
            .collect();

        SimulationReport {
            mode,
            elapsed,
            nodes,
            start_failures,
        }
    }
}

fn fire_link_event(
    stack: &InMemoryStack,
    manager: &Weak<RoutingManager>,
    event: ScheduledLinkEvent,
) {
    let Some(manager) = manager.upgrade() else {
        return;
    };

    info!(
        "Node {}: interface {} going {}",
        event.node,
        event.interface,
        if event.up { "up" } else { "down" }
    );

    let result = stack.set_interface_up(event.interface, event.up).and_then(|_| {
        if event.up {
            manager.notify_interface_up(event.node, event.interface)
        } else {
            manager.notify_interface_down(event.node, event.interface)
        }
    });
    if let Err(e) = result {
        warn!("Node {}: link event failed: {}", event.node, e);
    }
}

/// Print all tables every `period` of virtual time
fn arm_virtual_printer(
    scheduler: &Arc<VirtualScheduler>,
    manager: Weak<RoutingManager>,
    period: Duration,
) -> Result<()> {
    let weak_scheduler = Arc::downgrade(scheduler);
    scheduler.schedule(
        period,
        Box::new(move || {
            let (Some(scheduler), Some(routing)) = (weak_scheduler.upgrade(), manager.upgrade())
            else {
                return;
            };

            info!("Routing tables at t={:.1}s", scheduler.now().as_secs_f64());
            TablePrinter::print_tables(&routing);

            if let Err(e) = arm_virtual_printer(&scheduler, manager, period) {
                warn!("Failed to re-arm table printer: {}", e);
            }
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkEvent;

    #[test]
    fn test_default_virtual_run() {
        let simulation = Simulation::new(Config::default()).unwrap();
        let report = simulation.run_virtual().unwrap();

        assert!(report.start_failures.is_empty());
        assert_eq!(report.elapsed, Duration::from_secs(20));
        assert_eq!(report.nodes.len(), 2);

        // Updates at 0, 10 and 20
        for node in &report.nodes {
            assert_eq!(node.state, ProtocolState::Running);
            assert_eq!(node.stats.cycles_run, 3);
            assert_eq!(node.routes.len(), 1);
        }

        let first = report.node(NodeId::new(0)).unwrap();
        assert_eq!(first.routes[0].destination.to_string(), "10.1.1.2");
        assert_eq!(first.routes[0].next_hop.to_string(), "10.1.1.1");
    }

    #[test]
    fn test_unknown_interface_rejected() {
        let mut config = Config::default();
        config.simulation.link_events.push(LinkEvent {
            at_secs: 1.0,
            node: 0,
            interface: 3,
            up: false,
        });

        let simulation = Simulation::new(config).unwrap();
        assert!(simulation.run_virtual().is_err());
    }

    #[test]
    fn test_report_tables_in_node_order() {
        let simulation = Simulation::new(Config::default()).unwrap();
        let report = simulation.run_virtual().unwrap();

        let tables = report.tables();
        let first = tables.find("Node 0").unwrap();
        let second = tables.find("Node 1").unwrap();
        assert!(first < second);
    }
}

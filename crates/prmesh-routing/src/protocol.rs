//! Poisson-reverse routing protocol instance
//!
//! One instance per node. On start it binds the node's primary non-loopback
//! interface, runs an update cycle immediately and then once per update
//! interval. Each cycle estimates a cost to every other interface the node
//! knows about and installs the result; down interfaces are withdrawn.
//!
//! State machine: `Uninitialized -> Running -> Stopped` (terminal).

use crate::error::{Result, RoutingError};
use crate::estimator::{
    node_seed, validate_cost_parameter, BernoulliEstimator, CostEstimator, DEFAULT_TRIALS,
};
use crate::scheduler::{TimerId, UpdateScheduler};
use crate::stack::NetworkStack;
use crate::table::{RouteEntry, RoutePolicy, RoutingTable, UpsertOutcome};
use crate::types::{Address, Interface, InterfaceId, NodeId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Default interval between update cycles
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Default cost parameter
pub const DEFAULT_COST_PARAMETER: f64 = 1.0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Time between update cycles
    pub update_interval: Duration,
    /// Weight applied to inverse distance; must be finite and >= 0
    pub cost_parameter: f64,
    /// Bernoulli trials per cost estimate
    pub trials: u32,
    /// How refreshed routes replace existing ones
    pub route_policy: RoutePolicy,
    /// Run a cycle immediately when an interface goes down
    pub trigger_on_interface_down: bool,
    /// Deployment seed; each node derives its own stream from it
    pub seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            cost_parameter: DEFAULT_COST_PARAMETER,
            trials: DEFAULT_TRIALS,
            route_policy: RoutePolicy::LastWriteWins,
            trigger_on_interface_down: false,
            seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        validate_cost_parameter(self.cost_parameter)?;
        if self.update_interval.is_zero() {
            return Err(RoutingError::Configuration(
                "update interval must be greater than zero".to_string(),
            ));
        }
        if self.trials == 0 {
            return Err(RoutingError::Configuration(
                "trial count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a protocol instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    Uninitialized,
    Running,
    Stopped,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Uninitialized => write!(f, "Uninitialized"),
            ProtocolState::Running => write!(f, "Running"),
            ProtocolState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Protocol statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProtocolStats {
    pub cycles_run: u64,
    pub routes_installed: u64,
    pub routes_withdrawn: u64,
    pub candidates_skipped: u64,
    pub late_ticks_dropped: u64,
    /// Update timers that could not be re-armed; the instance stops on the first
    pub schedule_failures: u64,
}

/// What one update cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub installed: usize,
    pub unchanged: usize,
    pub withdrawn: usize,
    pub skipped: usize,
}

/// Routing protocol as seen by the node that hosts it
pub trait RoutingProtocol: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Bind to the node's interfaces and begin periodic updates
    fn start(&self) -> Result<()>;

    /// Stop updates, withdraw installed routes and release the table
    fn stop(&self);

    fn notify_interface_up(&self, interface: InterfaceId);

    fn notify_interface_down(&self, interface: InterfaceId);

    fn lookup(&self, destination: &Address) -> Option<RouteEntry>;

    /// Snapshot of the routing table, ordered by destination
    fn routes(&self) -> Vec<RouteEntry>;

    fn dump_table(&self) -> String;

    fn state(&self) -> ProtocolState;

    fn stats(&self) -> ProtocolStats;
}

struct Lifecycle {
    state: ProtocolState,
    bound: Option<Interface>,
    timer: Option<TimerId>,
}

struct ProtocolInner {
    node: NodeId,
    config: ProtocolConfig,
    stack: Arc<dyn NetworkStack>,
    scheduler: Arc<dyn UpdateScheduler>,
    table: RoutingTable,
    estimator: Mutex<Box<dyn CostEstimator>>,
    /// Interfaces reported down through notifications
    down_overrides: DashMap<InterfaceId, ()>,
    lifecycle: Mutex<Lifecycle>,
    /// Set by stop; checked at the start of every cycle
    cancelled: AtomicBool,
    /// Serializes update cycles against each other and against stop
    cycle_guard: Mutex<()>,
    stats: Mutex<ProtocolStats>,
}

/// Per-node Poisson-reverse routing protocol
pub struct PoissonReverseProtocol {
    inner: Arc<ProtocolInner>,
}

impl PoissonReverseProtocol {
    /// Create an instance using the Bernoulli cost estimator
    ///
    /// # Arguments
    /// * `node` - Node this instance routes for
    /// * `config` - Validated before anything else happens
    /// * `stack` - Source of interfaces and sink for installed routes
    /// * `scheduler` - Drives periodic update cycles
    pub fn new(
        node: NodeId,
        config: ProtocolConfig,
        stack: Arc<dyn NetworkStack>,
        scheduler: Arc<dyn UpdateScheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let estimator = match config.seed {
            Some(base) => BernoulliEstimator::new(
                config.cost_parameter,
                config.trials,
                node_seed(base, node),
            )?,
            None => BernoulliEstimator::from_entropy(config.cost_parameter, config.trials)?,
        };
        Self::with_estimator(node, config, stack, scheduler, Box::new(estimator))
    }

    /// Create an instance with a custom cost estimator
    pub fn with_estimator(
        node: NodeId,
        config: ProtocolConfig,
        stack: Arc<dyn NetworkStack>,
        scheduler: Arc<dyn UpdateScheduler>,
        estimator: Box<dyn CostEstimator>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(PoissonReverseProtocol {
            inner: Arc::new(ProtocolInner {
                node,
                config,
                stack,
                scheduler,
                table: RoutingTable::new(),
                estimator: Mutex::new(estimator),
                down_overrides: DashMap::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: ProtocolState::Uninitialized,
                    bound: None,
                    timer: None,
                }),
                cancelled: AtomicBool::new(false),
                cycle_guard: Mutex::new(()),
                stats: Mutex::new(ProtocolStats::default()),
            }),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// Interface this instance is bound to while running
    pub fn bound_interface(&self) -> Option<Interface> {
        lock(&self.inner.lifecycle).bound.clone()
    }

    /// The routing table, for the forwarding path and diagnostics
    pub fn table(&self) -> &RoutingTable {
        &self.inner.table
    }

    /// Run one update cycle now, outside the periodic schedule
    ///
    /// Does not re-arm the timer.
    pub fn run_update_cycle(&self) -> Result<CycleReport> {
        let _guard = lock(&self.inner.cycle_guard);
        let state = lock(&self.inner.lifecycle).state;
        if state != ProtocolState::Running || self.inner.cancelled.load(Ordering::SeqCst) {
            return Err(RoutingError::InvalidState {
                expected: ProtocolState::Running,
                actual: state,
            });
        }
        Ok(self.inner.update_cycle())
    }

    fn fail_start(&self, error: RoutingError) -> RoutingError {
        let inner = &self.inner;
        for entry in inner.table.clear() {
            if let Err(e) = inner.stack.remove_route(inner.node, entry.destination) {
                warn!("Node {}: failed to withdraw {}: {}", inner.node, entry.destination, e);
            }
        }
        let mut lifecycle = lock(&inner.lifecycle);
        lifecycle.state = ProtocolState::Uninitialized;
        lifecycle.bound = None;
        lifecycle.timer = None;
        error!("Node {}: protocol failed to start: {}", inner.node, error);
        error
    }
}

impl RoutingProtocol for PoissonReverseProtocol {
    fn node_id(&self) -> NodeId {
        self.inner.node
    }

    fn start(&self) -> Result<()> {
        let inner = &self.inner;

        let state = lock(&inner.lifecycle).state;
        if state != ProtocolState::Uninitialized {
            return Err(RoutingError::InvalidState {
                expected: ProtocolState::Uninitialized,
                actual: state,
            });
        }

        let interfaces = inner.stack.interfaces(inner.node)?;
        let bound = inner
            .select_primary(&interfaces)
            .ok_or(RoutingError::NoPrimaryInterface(inner.node))?;

        let _guard = lock(&inner.cycle_guard);
        {
            let mut lifecycle = lock(&inner.lifecycle);
            if lifecycle.state != ProtocolState::Uninitialized {
                return Err(RoutingError::InvalidState {
                    expected: ProtocolState::Uninitialized,
                    actual: lifecycle.state,
                });
            }
            lifecycle.state = ProtocolState::Running;
            lifecycle.bound = Some(bound.clone());
        }
        inner.table.set_owner(bound.address);

        info!(
            "Node {}: Poisson-reverse routing started on interface {} ({}), interval {:?}, cost parameter {}",
            inner.node,
            bound.id,
            bound.address,
            inner.config.update_interval,
            inner.config.cost_parameter
        );

        inner.update_cycle();
        if let Err(e) = ProtocolInner::arm(inner) {
            return Err(self.fail_start(e));
        }

        Ok(())
    }

    fn stop(&self) {
        let inner = &self.inner;
        inner.cancelled.store(true, Ordering::SeqCst);

        // Wait out any cycle already in flight
        let _guard = lock(&inner.cycle_guard);
        inner.shutdown();
    }

    fn notify_interface_up(&self, interface: InterfaceId) {
        if self.inner.down_overrides.remove(&interface).is_some() {
            debug!("Node {}: interface {} reported up", self.inner.node, interface);
        }
    }

    fn notify_interface_down(&self, interface: InterfaceId) {
        let inner = &self.inner;
        inner.down_overrides.insert(interface, ());
        debug!("Node {}: interface {} reported down", inner.node, interface);

        if inner.config.trigger_on_interface_down {
            let _guard = lock(&inner.cycle_guard);
            let running = lock(&inner.lifecycle).state == ProtocolState::Running;
            if running && !inner.cancelled.load(Ordering::SeqCst) {
                inner.update_cycle();
            }
        }
    }

    fn lookup(&self, destination: &Address) -> Option<RouteEntry> {
        self.inner.table.lookup(destination)
    }

    fn routes(&self) -> Vec<RouteEntry> {
        self.inner.table.enumerate()
    }

    fn dump_table(&self) -> String {
        self.inner.table.dump(self.inner.node)
    }

    fn state(&self) -> ProtocolState {
        lock(&self.inner.lifecycle).state
    }

    fn stats(&self) -> ProtocolStats {
        lock(&self.inner.stats).clone()
    }
}

impl Drop for PoissonReverseProtocol {
    fn drop(&mut self) {
        if self.state() == ProtocolState::Running {
            self.stop();
        }
    }
}

impl ProtocolInner {
    fn is_up(&self, interface: &Interface) -> bool {
        interface.up && !self.down_overrides.contains_key(&interface.id)
    }

    /// First owned non-loopback interface, preferring ones that are up
    fn select_primary(&self, interfaces: &[Interface]) -> Option<Interface> {
        let candidates: Vec<&Interface> = interfaces
            .iter()
            .filter(|i| i.is_owned_by(self.node) && !i.loopback)
            .collect();

        candidates
            .iter()
            .copied()
            .find(|i| self.is_up(i))
            .or_else(|| candidates.first().copied())
            .cloned()
    }

    /// Schedule the next tick
    fn arm(inner: &Arc<ProtocolInner>) -> Result<()> {
        if inner.cancelled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(inner);
        let id = inner.scheduler.schedule(
            inner.config.update_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    ProtocolInner::on_tick(&inner);
                }
            }),
        )?;
        lock(&inner.lifecycle).timer = Some(id);

        Ok(())
    }

    fn on_tick(inner: &Arc<ProtocolInner>) {
        let _guard = lock(&inner.cycle_guard);

        if inner.cancelled.load(Ordering::SeqCst) {
            lock(&inner.stats).late_ticks_dropped += 1;
            trace!("Node {}: {}", inner.node, RoutingError::SchedulerRaceIgnored);
            return;
        }

        lock(&inner.lifecycle).timer = None;
        inner.update_cycle();

        if let Err(e) = ProtocolInner::arm(inner) {
            error!(
                "Node {}: failed to re-arm update timer, stopping: {}",
                inner.node, e
            );
            lock(&inner.stats).schedule_failures += 1;
            inner.cancelled.store(true, Ordering::SeqCst);
            inner.shutdown();
        }
    }

    /// Cancel the timer, withdraw every route and enter `Stopped`
    ///
    /// Caller holds `cycle_guard` and has set `cancelled`.
    fn shutdown(&self) {
        let (previous, timer) = {
            let mut lifecycle = lock(&self.lifecycle);
            let previous = lifecycle.state;
            lifecycle.state = ProtocolState::Stopped;
            lifecycle.bound = None;
            (previous, lifecycle.timer.take())
        };
        if previous == ProtocolState::Stopped {
            return;
        }

        if let Some(id) = timer {
            if !self.scheduler.cancel(id) {
                trace!("Node {}: update timer already fired", self.node);
            }
        }

        let released = self.table.clear();
        for entry in &released {
            self.withdraw_installed(entry);
        }
        self.down_overrides.clear();

        if previous == ProtocolState::Running {
            info!(
                "Node {}: Poisson-reverse routing stopped, released {} routes",
                self.node,
                released.len()
            );
        }
    }

    /// One full pass over every known interface; caller holds `cycle_guard`
    fn update_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let Some(bound) = lock(&self.lifecycle).bound.clone() else {
            return report;
        };

        let interfaces = match self.stack.interfaces(self.node) {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Node {}: cannot read interfaces, skipping cycle: {}", self.node, e);
                return report;
            }
        };

        let bound_up = interfaces
            .iter()
            .find(|i| i.id == bound.id)
            .map_or(false, |i| self.is_up(i));

        if !bound_up {
            for entry in self.table.retain(|e| e.out_interface != bound.id) {
                self.withdraw_installed(&entry);
                report.withdrawn += 1;
            }
            debug!(
                "Node {}: bound interface {} is down, withdrew {} routes",
                self.node, bound.id, report.withdrawn
            );
        } else {
            let mut reachable = BTreeSet::new();

            for interface in &interfaces {
                if interface.loopback || interface.id == bound.id {
                    continue;
                }
                if interface.address == bound.address {
                    continue;
                }

                if !self.is_up(interface) {
                    if let Some(entry) = self.table.remove(&interface.address) {
                        self.withdraw_installed(&entry);
                        report.withdrawn += 1;
                    }
                    continue;
                }

                reachable.insert(interface.address);
                match self.refresh_route(&bound, interface) {
                    Ok(outcome) if outcome.changed() => report.installed += 1,
                    Ok(_) => report.unchanged += 1,
                    Err(e) => {
                        warn!("Node {}: {}", self.node, e);
                        report.skipped += 1;
                    }
                }
            }

            // Destinations that vanished from the stack
            for entry in self.table.retain(|e| reachable.contains(&e.destination)) {
                self.withdraw_installed(&entry);
                report.withdrawn += 1;
            }
        }

        {
            let mut stats = lock(&self.stats);
            stats.cycles_run += 1;
            stats.routes_installed += report.installed as u64;
            stats.routes_withdrawn += report.withdrawn as u64;
            stats.candidates_skipped += report.skipped as u64;
        }

        debug!(
            "Node {}: update cycle done ({} installed, {} unchanged, {} withdrawn, {} skipped)",
            self.node, report.installed, report.unchanged, report.withdrawn, report.skipped
        );

        report
    }

    fn refresh_route(&self, bound: &Interface, candidate: &Interface) -> Result<UpsertOutcome> {
        let destination = candidate.address;
        let skip = |reason: String| RoutingError::TransientEstimationSkip {
            destination,
            reason,
        };

        let cost = lock(&self.estimator)
            .estimate(bound.address, destination)
            .map_err(|e| skip(e.to_string()))?;
        if !cost.is_finite() || cost < 0.0 {
            return Err(skip(format!("estimator returned invalid cost {}", cost)));
        }

        let entry = RouteEntry {
            destination,
            next_hop: bound.address,
            cost,
            out_interface: bound.id,
        };

        // Only update cycles write the table, and they hold `cycle_guard`
        let previous = self.table.lookup(&destination);
        let outcome = self
            .table
            .upsert_with_policy(entry.clone(), self.config.route_policy);
        if outcome.changed() {
            if let Err(e) = self.stack.install_route(self.node, &entry) {
                // Keep the table matching what the stack still forwards with
                match previous {
                    Some(installed) => {
                        self.table.upsert(installed);
                    }
                    None => {
                        self.table.remove(&destination);
                    }
                }
                return Err(skip(format!("install failed: {}", e)));
            }
            debug!(
                "Node {}: route to {} via {} cost {:.4}",
                self.node, destination, entry.next_hop, cost
            );
        }

        Ok(outcome)
    }

    fn withdraw_installed(&self, entry: &RouteEntry) {
        match self.stack.remove_route(self.node, entry.destination) {
            Ok(()) => debug!("Node {}: withdrew route to {}", self.node, entry.destination),
            Err(e) => warn!(
                "Node {}: failed to withdraw {}: {}",
                self.node, entry.destination, e
            ),
        }
    }
}

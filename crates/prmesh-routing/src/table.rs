//! Per-instance routing table
//!
//! Destination-keyed route store owned by one protocol instance. Every write
//! replaces a whole entry under the table lock, so readers on other threads
//! (the forwarding path, diagnostics) never observe a half-written route.

use crate::types::{Address, InterfaceId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// A destination's chosen next hop, cost and egress interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: Address,
    pub next_hop: Address,
    pub cost: f64,
    pub out_interface: InterfaceId,
}

/// How an upsert treats an existing entry for the same destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Always replace the existing entry
    #[default]
    LastWriteWins,
    /// Replace only when the new cost is strictly lower
    KeepLowerCost,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No entry existed for the destination
    Inserted,
    /// An existing entry was replaced
    Replaced,
    /// The existing entry was kept (identical, or cheaper under `KeepLowerCost`)
    Unchanged,
    /// The entry would have been a self-route
    Rejected,
}

impl UpsertOutcome {
    /// Whether the table contents changed
    pub fn changed(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Replaced)
    }
}

#[derive(Debug, Default)]
struct TableState {
    owner: Option<Address>,
    routes: BTreeMap<Address, RouteEntry>,
}

/// Destination -> route mapping guarded by a per-table lock
#[derive(Debug, Default)]
pub struct RoutingTable {
    state: RwLock<TableState>,
}

impl RoutingTable {
    /// Create an empty table with no owner address yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table owned by `owner`
    pub fn with_owner(owner: Address) -> Self {
        let table = Self::new();
        table.set_owner(owner);
        table
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the interface this table belongs to
    pub fn owner(&self) -> Option<Address> {
        self.read().owner
    }

    /// Set the owner address, dropping any route that would now be a self-route
    pub fn set_owner(&self, owner: Address) {
        let mut state = self.write();
        state.owner = Some(owner);
        if state.routes.remove(&owner).is_some() {
            debug!("Dropped self-route to {} after owner change", owner);
        }
    }

    /// Insert or atomically replace the entry for `entry.destination`
    pub fn upsert(&self, entry: RouteEntry) -> UpsertOutcome {
        self.upsert_with_policy(entry, RoutePolicy::LastWriteWins)
    }

    /// Insert or replace according to `policy`
    pub fn upsert_with_policy(&self, entry: RouteEntry, policy: RoutePolicy) -> UpsertOutcome {
        let mut state = self.write();

        if state.owner == Some(entry.destination) {
            warn!(
                "Rejected self-route to {} via {}",
                entry.destination, entry.next_hop
            );
            return UpsertOutcome::Rejected;
        }

        let outcome = match state.routes.get(&entry.destination) {
            None => UpsertOutcome::Inserted,
            Some(existing) if *existing == entry => UpsertOutcome::Unchanged,
            Some(existing)
                if policy == RoutePolicy::KeepLowerCost && existing.cost <= entry.cost =>
            {
                UpsertOutcome::Unchanged
            }
            Some(_) => UpsertOutcome::Replaced,
        };

        if outcome.changed() {
            state.routes.insert(entry.destination, entry);
        }
        outcome
    }

    /// Withdraw the route to `destination`; no-op if absent
    pub fn remove(&self, destination: &Address) -> Option<RouteEntry> {
        self.write().routes.remove(destination)
    }

    pub fn lookup(&self, destination: &Address) -> Option<RouteEntry> {
        self.read().routes.get(destination).cloned()
    }

    /// Consistent snapshot of every route, ordered by destination
    pub fn enumerate(&self) -> Vec<RouteEntry> {
        self.read().routes.values().cloned().collect()
    }

    /// Keep only routes matching `keep`; returns the withdrawn entries
    pub fn retain<F>(&self, mut keep: F) -> Vec<RouteEntry>
    where
        F: FnMut(&RouteEntry) -> bool,
    {
        let mut state = self.write();
        let withdrawn: Vec<Address> = state
            .routes
            .values()
            .filter(|entry| !keep(entry))
            .map(|entry| entry.destination)
            .collect();

        withdrawn
            .iter()
            .filter_map(|destination| state.routes.remove(destination))
            .collect()
    }

    /// Drop every route and forget the owner
    pub fn clear(&self) -> Vec<RouteEntry> {
        let mut state = self.write();
        state.owner = None;
        std::mem::take(&mut state.routes).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().routes.is_empty()
    }

    /// Human-readable listing ordered by destination
    pub fn dump(&self, node: NodeId) -> String {
        let state = self.read();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Node {} Poisson-reverse routing table ({} routes)",
            node,
            state.routes.len()
        );
        let _ = writeln!(
            out,
            "{:<16} {:<16} {:<6} {:>10}",
            "Destination", "NextHop", "Iface", "Cost"
        );
        for entry in state.routes.values() {
            let _ = writeln!(
                out,
                "{:<16} {:<16} {:<6} {:>10.4}",
                entry.destination, entry.next_hop, entry.out_interface, entry.cost
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn entry(destination: &str, cost: f64) -> RouteEntry {
        RouteEntry {
            destination: addr(destination),
            next_hop: addr("10.1.1.1"),
            cost,
            out_interface: InterfaceId::new(1),
        }
    }

    #[test]
    fn test_upsert_and_lookup() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        assert_eq!(table.upsert(entry("10.1.1.2", 3.0)), UpsertOutcome::Inserted);
        assert_eq!(table.lookup(&addr("10.1.1.2")), Some(entry("10.1.1.2", 3.0)));
        assert_eq!(table.lookup(&addr("10.1.1.3")), None);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        let e = entry("10.1.1.2", 42.0);

        table.upsert(e.clone());
        let first = table.lookup(&e.destination);
        assert_eq!(table.upsert(e.clone()), UpsertOutcome::Unchanged);

        assert_eq!(table.lookup(&e.destination), first);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        table.upsert(entry("10.1.1.2", 10.0));
        assert_eq!(table.upsert(entry("10.1.1.2", 80.0)), UpsertOutcome::Replaced);
        assert_eq!(table.lookup(&addr("10.1.1.2")).unwrap().cost, 80.0);
    }

    #[test]
    fn test_keep_lower_cost_policy() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        let policy = RoutePolicy::KeepLowerCost;

        table.upsert_with_policy(entry("10.1.1.2", 10.0), policy);
        assert_eq!(
            table.upsert_with_policy(entry("10.1.1.2", 25.0), policy),
            UpsertOutcome::Unchanged
        );
        assert_eq!(table.lookup(&addr("10.1.1.2")).unwrap().cost, 10.0);

        assert_eq!(
            table.upsert_with_policy(entry("10.1.1.2", 4.0), policy),
            UpsertOutcome::Replaced
        );
        assert_eq!(table.lookup(&addr("10.1.1.2")).unwrap().cost, 4.0);
    }

    #[test]
    fn test_rejects_self_route() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        assert_eq!(table.upsert(entry("10.1.1.1", 1.0)), UpsertOutcome::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn test_owner_change_drops_new_self_route() {
        let table = RoutingTable::new();
        assert_eq!(table.owner(), None);
        table.upsert(entry("10.1.1.5", 1.0));
        table.set_owner(addr("10.1.1.5"));
        assert_eq!(table.owner(), Some(addr("10.1.1.5")));
        assert!(table.lookup(&addr("10.1.1.5")).is_none());
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        assert!(table.remove(&addr("10.1.1.9")).is_none());

        table.upsert(entry("10.1.1.2", 1.0));
        assert!(table.remove(&addr("10.1.1.2")).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_enumerate_is_ordered() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        table.upsert(entry("10.1.2.2", 1.0));
        table.upsert(entry("10.1.1.2", 2.0));
        table.upsert(entry("10.1.3.2", 3.0));

        let destinations: Vec<String> = table
            .enumerate()
            .into_iter()
            .map(|e| e.destination.to_string())
            .collect();
        assert_eq!(destinations, vec!["10.1.1.2", "10.1.2.2", "10.1.3.2"]);
    }

    #[test]
    fn test_retain_returns_withdrawn() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        table.upsert(entry("10.1.1.2", 1.0));
        table.upsert(entry("10.1.1.3", 50.0));

        let withdrawn = table.retain(|e| e.cost < 10.0);
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].destination, addr("10.1.1.3"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dump_lists_routes() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        table.upsert(entry("10.1.1.2", 100.0));

        let dump = table.dump(NodeId::new(0));
        assert!(dump.starts_with("Node 0 "));
        assert!(dump.contains("10.1.1.2"));
        assert!(dump.contains("100.0000"));
    }

    #[test]
    fn test_dump_columns_are_padded() {
        let table = RoutingTable::with_owner(addr("10.1.1.1"));
        table.upsert(entry("10.1.1.2", 7.5));

        let row = table.dump(NodeId::new(0)).lines().nth(2).unwrap().to_string();
        let expected = format!(
            "{:<16} {:<16} {:<6} {:>10.4}",
            "10.1.1.2", "10.1.1.1", "1", 7.5
        );
        assert_eq!(row, expected);
        assert_eq!(&row[34..41], "1      ");
    }

    #[test]
    fn test_concurrent_readers_see_whole_entries() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(RoutingTable::with_owner(addr("10.1.1.1")));
        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..1_000u32 {
                    let cost = f64::from(i);
                    table.upsert(RouteEntry {
                        destination: addr("10.1.1.2"),
                        next_hop: Address::from_u32(i),
                        cost,
                        out_interface: InterfaceId::new(i),
                    });
                }
            })
        };

        for _ in 0..1_000 {
            if let Some(e) = table.lookup(&addr("10.1.1.2")) {
                // Every field comes from the same write
                assert_eq!(e.next_hop.as_u32(), e.out_interface.as_u32());
                assert_eq!(e.cost, f64::from(e.out_interface.as_u32()));
            }
        }

        writer.join().unwrap();
    }
}

//! PRMesh Poisson-Reverse Routing
//!
//! Per-node routing protocol core:
//! - Bounded probabilistic link cost estimation
//! - Lock-guarded per-instance routing table
//! - Self-rearming update timers (tokio or virtual clock)
//! - Protocol instance state machine and lifecycle management
//!
//! Each node recomputes its routes independently from the interfaces its
//! network stack reports; there is no neighbour table exchange.

pub mod error;
pub mod estimator;
pub mod lifecycle;
pub mod protocol;
pub mod scheduler;
pub mod stack;
pub mod table;
pub mod types;

pub use error::{Result, RoutingError};
pub use estimator::{BernoulliEstimator, CostEstimator, DEFAULT_TRIALS};
pub use lifecycle::RoutingManager;
pub use protocol::{
    CycleReport, PoissonReverseProtocol, ProtocolConfig, ProtocolState, ProtocolStats,
    RoutingProtocol, DEFAULT_COST_PARAMETER, DEFAULT_UPDATE_INTERVAL,
};
pub use scheduler::{TimerId, TokioScheduler, UpdateScheduler, VirtualScheduler};
pub use stack::{InMemoryStack, NetworkStack};
pub use table::{RouteEntry, RoutePolicy, RoutingTable, UpsertOutcome};
pub use types::{Address, Interface, InterfaceId, NodeId};

//! PRMesh Node
//!
//! Simulation host for the Poisson-reverse routing protocol:
//! - YAML configuration with CLI overrides
//! - Topology construction on an in-memory network stack
//! - Virtual-clock and realtime runs with scheduled link events
//! - Periodic and final routing table reports

pub mod config;
pub mod monitor;
pub mod simulation;
pub mod topology;

pub use config::{Config, SimulationMode};
pub use simulation::{NodeReport, Simulation, SimulationReport};
pub use topology::Topology;

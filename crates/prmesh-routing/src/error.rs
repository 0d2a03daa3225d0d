//! Routing error types

use crate::protocol::ProtocolState;
use crate::types::{Address, NodeId};
use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Skipped cost estimation for {destination}: {reason}")]
    TransientEstimationSkip { destination: Address, reason: String },

    #[error("Timer fired after the protocol was stopped")]
    SchedulerRaceIgnored,

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Node {0} has no usable non-loopback interface")]
    NoPrimaryInterface(NodeId),

    #[error("Invalid protocol state: expected {expected}, found {actual}")]
    InvalidState {
        expected: ProtocolState,
        actual: ProtocolState,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Routing already enabled on node {0}")]
    AlreadyEnabled(NodeId),

    #[error("Network stack error: {0}")]
    Stack(String),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;

//! Node, interface and address types shared by every routing component

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, Ipv4Addr};
use std::str::FromStr;

/// IPv4-style interface address
///
/// The integer encoding doubles as the distance proxy used by the cost
/// estimator, so ordering and arithmetic follow the numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Ipv4Addr", into = "Ipv4Addr")]
pub struct Address(u32);

impl Address {
    /// Loopback address assigned to every node's `lo` interface
    pub const LOOPBACK: Address = Address(0x7f00_0001);

    /// Create an address from its integer encoding
    pub const fn from_u32(value: u32) -> Self {
        Address(value)
    }

    /// Integer encoding of this address
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Absolute numeric difference between two addresses
    pub fn distance(&self, other: &Address) -> u32 {
        self.0.abs_diff(other.0)
    }

    /// Address `offset` positions above this one (wrapping)
    pub fn offset(&self, offset: u32) -> Address {
        Address(self.0.wrapping_add(offset))
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Address(u32::from(addr))
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl FromStr for Address {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Address::from)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Pad through Ipv4Addr so table columns line up
        fmt::Display::fmt(&Ipv4Addr::from(*self), f)
    }
}

/// Node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        NodeId(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Interface identifier, unique within one network stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceId(u32);

impl InterfaceId {
    pub const fn new(id: u32) -> Self {
        InterfaceId(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A node's network attachment point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface identifier
    pub id: InterfaceId,
    /// Owning node
    pub node: NodeId,
    /// Local address
    pub address: Address,
    /// Liveness as reported by the network stack
    pub up: bool,
    /// Loopback interfaces never take part in routing
    pub loopback: bool,
}

impl Interface {
    /// Whether this interface belongs to `node`
    pub fn is_owned_by(&self, node: NodeId) -> bool {
        self.node == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: Address = "10.1.1.2".parse().unwrap();
        assert_eq!(addr.as_u32(), 0x0a01_0102);
        assert_eq!(addr.to_string(), "10.1.1.2");
        assert!("10.1.1".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_distance() {
        let a = Address::from_u32(10);
        let b = Address::from_u32(20);
        assert_eq!(a.distance(&b), 10);
        assert_eq!(b.distance(&a), 10);
        assert_eq!(a.distance(&a), 0);
    }

    #[test]
    fn test_address_offset() {
        let base: Address = "10.1.1.0".parse().unwrap();
        assert_eq!(base.offset(1).to_string(), "10.1.1.1");
        assert_eq!(base.offset(2).to_string(), "10.1.1.2");
        assert_eq!(Ipv4Addr::from(Address::LOOPBACK), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_ids_honour_width() {
        assert_eq!(format!("{:<4}|", InterfaceId::new(7)), "7   |");
        assert_eq!(format!("{:>4}|", NodeId::new(12)), "  12|");
        assert_eq!(format!("{:<16}|", Address::from_u32(1)).len(), 17);
    }
}

//! Node identifiers and bus addresses

use serde::{Deserialize, Serialize};

/// Base of the CSR register space every node exposes
pub const CSR_REGISTER_BASE: u64 = 0xFFFF_F000_0000;

/// Offset of the configuration ROM within the CSR space
pub const CSR_CONFIG_ROM: u64 = 0x400;

/// Offsets are 48 bits wide on the wire
pub const OFFSET_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Bus id used to address nodes on the local bus
pub const LOCAL_BUS: u16 = 0x3FF;

/// 16-bit node identifier: 10-bit bus id followed by 6-bit physical id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Address a node on the local bus by its physical id
    pub fn local(phy: u8) -> Self {
        Self::new(LOCAL_BUS, phy)
    }

    pub fn new(bus: u16, phy: u8) -> Self {
        Self(((bus & 0x3FF) << 6) | (phy as u16 & 0x3F))
    }

    pub fn bus(&self) -> u16 {
        self.0 >> 6
    }

    pub fn phy(&self) -> u8 {
        (self.0 & 0x3F) as u8
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.bus() == LOCAL_BUS {
            write!(f, "{}", self.phy())
        } else {
            write!(f, "{}.{}", self.bus(), self.phy())
        }
    }
}

/// A node plus a 48-bit offset in its address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    node: NodeId,
    offset: u64,
}

impl BusAddress {
    pub fn new(node: NodeId, offset: u64) -> Self {
        Self {
            node,
            offset: offset & OFFSET_MASK,
        }
    }

    /// Address relative to the node's CSR register base
    pub fn csr(node: NodeId, csr_offset: u64) -> Self {
        Self::new(node, CSR_REGISTER_BASE + csr_offset)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Address `quadlets` quadlets further along in the same node
    pub fn add_quadlets(&self, quadlets: u64) -> Self {
        Self::new(self.node, self.offset + quadlets * 4)
    }
}

impl std::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:#014x}", self.node, self.offset)
    }
}

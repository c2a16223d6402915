//! avbus Discovery - bus enumeration
//!
//! Walks every node on each port, reading its GUID, configuration ROM and,
//! for AV/C devices, its plug registers.

pub mod scanner;

pub use scanner::{BusScanner, DeviceMatch, DiscoveryEvent, NodeReport, PlugReport, ScannerConfig};

//! avbus Core - protocol types shared by the avbus crates
//!
//! This crate provides the foundational types for talking to IEEE-1394 nodes:
//! - Node identifiers and 48-bit bus addresses
//! - Acknowledgement, response and transaction codes
//! - Configuration ROM directory model and node classification
//! - Plug control register layouts (IEC 61883-1)
//! - Asynchronous response packet encoding

pub mod codes;
pub mod directory;
pub mod node;
pub mod packet;
pub mod plug;

pub use codes::{AckCode, ExtendedCode, PackedStatus, ResponseCode};
pub use directory::{classify, BusOptions, CharacterSet, ConfigDirectory, DirectoryEntry, NodeType, TextLeaf};
pub use node::{BusAddress, NodeId, CSR_CONFIG_ROM, CSR_REGISTER_BASE};
pub use packet::{ArmRequest, ArmRequestType, PacketError, ResponseHeader, ResponsePacket};
pub use plug::{DataRate, InputMpr, InputPcr, OutputMpr, OutputPcr, PlugDirection, RegisterBlock, BROADCAST_CHANNEL_NONE, PCR_MAX};

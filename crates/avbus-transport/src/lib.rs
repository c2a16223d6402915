//! avbus Transport - transactions against IEEE-1394 nodes
//!
//! This crate drives the bus through the [`Bus`] trait:
//! - Bounded retry of busy transactions with pluggable status classification
//! - Configuration ROM walking
//! - FCP command/response correlation and AV/C commands
//! - Remote plug register access
//! - An in-process simulated bus

pub mod avc;
pub mod bus;
pub mod fcp;
pub mod plug;
pub mod retry;
pub mod rom;
pub mod sim;

pub use avc::{AvcClient, AvcCommand, AvcError, AvcResponse, PanelOperation, VcrCommand};
pub use bus::{ArmHandler, Bus, FcpHandler, PortInfo};
pub use fcp::{CommandResponseCorrelator, CorrelatorState, FcpConfig, FcpError, ResponseCapture, ResponseHandle};
pub use plug::{PlugClient, PlugError};
pub use retry::{BusError, ErrnoClassifier, OutcomeClassifier, PackedAckClassifier, RetryPolicy, TransactionRetrier};
pub use rom::{BusInfo, ConfigDirectoryParser, ParseError, ParserConfig};
pub use sim::{RomBuilder, RomEntry, SimAbi, SimAvc, SimBus, SimNode};

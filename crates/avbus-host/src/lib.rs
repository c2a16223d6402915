//! avbus Host - plug control registers served by the local node
//!
//! Remote nodes read and compare-swap our master and plug control registers
//! exactly as they would on a real device.

pub mod emulator;

pub use emulator::{host_inputs, host_outputs, HostError, PlugHost, RegisterEmulator};

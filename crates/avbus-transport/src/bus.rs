//! Bus access abstraction
//!
//! Every component talks to the bus through the [`Bus`] trait so the same
//! code runs against a kernel stack or the in-process [`SimBus`](crate::sim::SimBus).
//! Primitive calls return the raw status word of the stack; interpreting it
//! is the job of an [`OutcomeClassifier`](crate::retry::OutcomeClassifier).

use std::io;
use std::sync::Arc;

use avbus_core::{AckCode, ArmRequest, BusAddress, ExtendedCode, NodeId};

/// Receives requests that remote nodes make against a hosted address range
pub trait ArmHandler: Send + Sync {
    /// Handle one request. Responses go out through `bus.send_async`; the
    /// returned code is the acknowledgement for the request itself.
    fn handle(&self, bus: &dyn Bus, request: &ArmRequest) -> AckCode;
}

/// Receives frames written to the local FCP command/response registers
pub trait FcpHandler: Send + Sync {
    fn on_frame(&self, source: NodeId, response: bool, data: &[u8]);
}

/// One host adapter port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub nodes: usize,
}

pub trait Bus: Send + Sync {
    /// Read `buf.len()` bytes; returns the stack status word
    fn read(&self, addr: BusAddress, buf: &mut [u8]) -> io::Result<u32>;

    /// Write `data`; returns the stack status word
    fn write(&self, addr: BusAddress, data: &[u8]) -> io::Result<u32>;

    /// Quadlet lock transaction. `arg` is the compare operand for
    /// compare-swap; the value held before the operation lands in `old`.
    fn lock(
        &self,
        addr: BusAddress,
        code: ExtendedCode,
        data: u32,
        arg: u32,
        old: &mut u32,
    ) -> io::Result<u32>;

    /// Queue a raw asynchronous packet, typically a response
    fn send_async(&self, packet: &[u8]) -> io::Result<()>;

    /// Host `length` bytes at `start` in the local address space
    fn register_range(&self, start: u64, length: usize, handler: Arc<dyn ArmHandler>) -> io::Result<()>;

    fn unregister_range(&self, start: u64) -> io::Result<()>;

    fn start_fcp_listen(&self, handler: Arc<dyn FcpHandler>) -> io::Result<()>;

    fn stop_fcp_listen(&self) -> io::Result<()>;

    /// Number of physical ids in use on the current port
    fn node_count(&self) -> usize;

    fn local_id(&self) -> NodeId;

    fn ports(&self) -> io::Result<Vec<PortInfo>>;

    fn set_port(&self, port: usize) -> io::Result<()>;
}

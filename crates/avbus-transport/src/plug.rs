//! Plug register access on remote nodes
//!
//! Registers are updated with a compare-swap against the value just read,
//! so a concurrent writer is detected instead of silently overwritten.

use avbus_core::plug::csr;
use avbus_core::{BusAddress, ExtendedCode, InputMpr, InputPcr, NodeId, OutputMpr, OutputPcr, PCR_MAX};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::retry::{BusError, TransactionRetrier};

#[derive(Error, Debug)]
pub enum PlugError {
    #[error("Plug {0} out of range")]
    OutOfRange(usize),
    #[error("Register changed concurrently: expected {expected:#010x}, found {found:#010x}")]
    Contention { expected: u32, found: u32 },
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct PlugClient<'a> {
    bus: &'a dyn Bus,
    retrier: &'a TransactionRetrier,
}

impl<'a> PlugClient<'a> {
    pub fn new(bus: &'a dyn Bus, retrier: &'a TransactionRetrier) -> Self {
        Self { bus, retrier }
    }

    /// Read the register at `csr_offset` in host order
    pub fn get(&self, node: NodeId, csr_offset: u64) -> Result<u32, PlugError> {
        Ok(self.retrier.read_quadlet(self.bus, BusAddress::csr(node, csr_offset))?)
    }

    /// Replace the register at `csr_offset` with `value`
    pub fn set(&self, node: NodeId, csr_offset: u64, value: u32) -> Result<(), PlugError> {
        let addr = BusAddress::csr(node, csr_offset);
        let current = self.retrier.read_quadlet(self.bus, addr)?;
        let old = self
            .retrier
            .lock(self.bus, addr, ExtendedCode::CompareSwap, value, current)?;
        if old != current {
            warn!(addr = %addr, expected = current, found = old, "Compare-swap lost a race");
            return Err(PlugError::Contention { expected: current, found: old });
        }
        debug!(addr = %addr, old, new = value, "Plug register updated");
        Ok(())
    }

    pub fn output_mpr(&self, node: NodeId) -> Result<OutputMpr, PlugError> {
        Ok(OutputMpr::unpack(self.get(node, csr::OUTPUT_MPR)?))
    }

    pub fn set_output_mpr(&self, node: NodeId, mpr: OutputMpr) -> Result<(), PlugError> {
        self.set(node, csr::OUTPUT_MPR, mpr.pack())
    }

    pub fn input_mpr(&self, node: NodeId) -> Result<InputMpr, PlugError> {
        Ok(InputMpr::unpack(self.get(node, csr::INPUT_MPR)?))
    }

    pub fn set_input_mpr(&self, node: NodeId, mpr: InputMpr) -> Result<(), PlugError> {
        self.set(node, csr::INPUT_MPR, mpr.pack())
    }

    pub fn output_pcr(&self, node: NodeId, plug: usize) -> Result<OutputPcr, PlugError> {
        Ok(OutputPcr::unpack(self.get(node, pcr_offset(csr::OUTPUT_PCR_0, plug)?)?))
    }

    pub fn set_output_pcr(&self, node: NodeId, plug: usize, pcr: OutputPcr) -> Result<(), PlugError> {
        self.set(node, pcr_offset(csr::OUTPUT_PCR_0, plug)?, pcr.pack())
    }

    pub fn input_pcr(&self, node: NodeId, plug: usize) -> Result<InputPcr, PlugError> {
        Ok(InputPcr::unpack(self.get(node, pcr_offset(csr::INPUT_PCR_0, plug)?)?))
    }

    pub fn set_input_pcr(&self, node: NodeId, plug: usize, pcr: InputPcr) -> Result<(), PlugError> {
        self.set(node, pcr_offset(csr::INPUT_PCR_0, plug)?, pcr.pack())
    }
}

fn pcr_offset(base: u64, plug: usize) -> Result<u64, PlugError> {
    if plug >= PCR_MAX {
        return Err(PlugError::OutOfRange(plug));
    }
    Ok(base + 4 * plug as u64)
}

//! Register emulation for locally hosted plugs
//!
//! Each hosted block covers one MPR and `PCR_MAX` PCRs. Quadlet reads are
//! answered from the block; compare-swap locks update it atomically under
//! the block's mutex. Any other access is refused.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use avbus_core::plug::BLOCK_QUADLETS;
use avbus_core::{
    AckCode, ArmRequest, ArmRequestType, ExtendedCode, InputMpr, InputPcr, OutputMpr, OutputPcr,
    PacketError, PlugDirection, RegisterBlock, ResponseCode, ResponsePacket, CSR_REGISTER_BASE,
};
use avbus_transport::{ArmHandler, Bus};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to host {direction} plugs at {start:#x}: {source}")]
    Register {
        direction: PlugDirection,
        start: u64,
        source: io::Error,
    },
    #[error("Failed to stop hosting plugs at {start:#x}: {source}")]
    Unregister { start: u64, source: io::Error },
}

/// Answers remote requests against one register block
pub struct RegisterEmulator {
    direction: PlugDirection,
    base: u64,
    block: Mutex<RegisterBlock>,
}

impl RegisterEmulator {
    pub fn new(direction: PlugDirection, block: RegisterBlock) -> Self {
        Self {
            direction,
            base: CSR_REGISTER_BASE + direction.mpr_offset(),
            block: Mutex::new(block),
        }
    }

    /// Absolute offset of the MPR
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn snapshot(&self) -> RegisterBlock {
        self.block().clone()
    }

    fn block(&self) -> MutexGuard<'_, RegisterBlock> {
        self.block.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Quadlet index addressed by `offset`, if it is aligned and in the block
    fn index(&self, offset: u64) -> Option<usize> {
        let delta = offset.checked_sub(self.base)?;
        if delta % 4 != 0 {
            return None;
        }
        let index = (delta / 4) as usize;
        (index < BLOCK_QUADLETS).then_some(index)
    }

    fn read(&self, request: &ArmRequest) -> ResponsePacket {
        match self.index(request.destination_offset) {
            Some(index) => {
                let value = self.block().quadlet(index).unwrap_or_default();
                ResponsePacket::read_response(request, ResponseCode::Complete, value)
            }
            None => ResponsePacket::read_response(request, ResponseCode::AddressError, 0),
        }
    }

    fn lock(&self, request: &ArmRequest) -> Result<ResponsePacket, PacketError> {
        if request.extended_code != ExtendedCode::CompareSwap {
            debug!(code = ?request.extended_code, "Unsupported lock on hosted plug");
            return ResponsePacket::lock_response(request, ResponseCode::TypeError, None);
        }
        let Some(index) = self.index(request.destination_offset) else {
            return ResponsePacket::lock_response(request, ResponseCode::AddressError, None);
        };
        let (Some(compare), Some(swap)) = (request.buffer.get(0..4), request.payload_quadlet(1)) else {
            return ResponsePacket::lock_response(request, ResponseCode::DataError, None);
        };

        let mut block = self.block();
        let old = block.quadlet(index).unwrap_or_default();
        if old.to_be_bytes() == compare {
            block.set_quadlet(index, swap);
            debug!(
                direction = %self.direction,
                index,
                old = format_args!("{:#010x}", old),
                new = format_args!("{:#010x}", swap),
                "Hosted plug register swapped"
            );
        }
        drop(block);
        ResponsePacket::lock_response(request, ResponseCode::Complete, Some(old))
    }
}

impl ArmHandler for RegisterEmulator {
    fn handle(&self, bus: &dyn Bus, request: &ArmRequest) -> AckCode {
        if request.requested_length != 4 {
            warn!(
                source = %request.source,
                length = request.requested_length,
                "Only quadlet access to plug registers is supported"
            );
            return AckCode::Other(AckCode::TYPE_ERROR);
        }

        let packet = match request.request_type {
            ArmRequestType::Read => Ok(self.read(request)),
            ArmRequestType::Lock => self.lock(request),
            ArmRequestType::Write => {
                warn!(source = %request.source, "Write to plug register refused");
                return AckCode::Other(AckCode::TYPE_ERROR);
            }
        };
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Could not build plug register response");
                return AckCode::Other(AckCode::DATA_ERROR);
            }
        };

        match bus.send_async(&packet.to_bytes()) {
            Ok(()) => AckCode::Complete,
            Err(e) => {
                warn!(error = %e, "Failed to send plug register response");
                AckCode::Other(AckCode::DATA_ERROR)
            }
        }
    }
}

/// A register block registered on the bus; unregisters itself when dropped
pub struct PlugHost {
    bus: Arc<dyn Bus>,
    emulator: Arc<RegisterEmulator>,
    registered: bool,
}

impl PlugHost {
    fn register(bus: Arc<dyn Bus>, direction: PlugDirection, block: RegisterBlock) -> Result<Self, HostError> {
        let emulator = Arc::new(RegisterEmulator::new(direction, block));
        let start = emulator.base();
        let handler: Arc<dyn ArmHandler> = emulator.clone();
        bus.register_range(start, RegisterBlock::size_bytes(), handler)
            .map_err(|source| HostError::Register {
                direction,
                start,
                source,
            })?;
        info!(
            direction = %direction,
            start = format_args!("{:#x}", start),
            plugs = emulator.snapshot().n_plugs(),
            "Hosting plug registers"
        );
        Ok(Self {
            bus,
            emulator,
            registered: true,
        })
    }

    pub fn direction(&self) -> PlugDirection {
        self.emulator.direction
    }

    pub fn snapshot(&self) -> RegisterBlock {
        self.emulator.snapshot()
    }

    pub fn unregister(mut self) -> Result<(), HostError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), HostError> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        let start = self.emulator.base();
        self.bus
            .unregister_range(start)
            .map_err(|source| HostError::Unregister { start, source })?;
        info!(direction = %self.emulator.direction, "Stopped hosting plug registers");
        Ok(())
    }
}

impl Drop for PlugHost {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Plug registers left registered");
        }
    }
}

/// Host output plugs: an oMPR and `n_plugs` oPCRs cloned from the prototype
pub fn host_outputs(bus: Arc<dyn Bus>, mpr: OutputMpr, pcr: OutputPcr) -> Result<PlugHost, HostError> {
    PlugHost::register(bus, PlugDirection::Output, RegisterBlock::outputs(mpr, pcr))
}

/// Host input plugs: an iMPR and `n_plugs` iPCRs cloned from the prototype
pub fn host_inputs(bus: Arc<dyn Bus>, mpr: InputMpr, pcr: InputPcr) -> Result<PlugHost, HostError> {
    PlugHost::register(bus, PlugDirection::Input, RegisterBlock::inputs(mpr, pcr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use avbus_core::codes::tcode;
    use avbus_core::plug::csr;
    use avbus_core::{BusAddress, NodeId, ResponseHeader, PCR_MAX};
    use avbus_transport::{PlugClient, RetryPolicy, SimBus, SimNode, TransactionRetrier};

    fn bus() -> Arc<SimBus> {
        Arc::new(SimBus::new(0).with_node(1, SimNode::new()))
    }

    fn proto_pcr() -> OutputPcr {
        OutputPcr {
            payload: 122,
            overhead_id: 15,
            channel: 63,
            online: true,
            ..Default::default()
        }
    }

    fn lock_request(offset: u64, code: ExtendedCode, compare: u32, swap: u32) -> ArmRequest {
        let mut buffer = compare.to_be_bytes().to_vec();
        buffer.extend_from_slice(&swap.to_be_bytes());
        ArmRequest {
            source: NodeId::local(1),
            destination: NodeId::local(0),
            tlabel: 3,
            tcode: tcode::LOCK_REQUEST,
            extended_code: code,
            destination_offset: offset,
            request_type: ArmRequestType::Lock,
            requested_length: 4,
            buffer,
        }
    }

    fn payload(packet: &[u8]) -> u32 {
        u32::from_be_bytes([packet[16], packet[17], packet[18], packet[19]])
    }

    #[test]
    fn test_plug_count_is_clamped() {
        let bus = bus();
        let host = host_outputs(
            bus.clone(),
            OutputMpr { n_plugs: 40, ..Default::default() },
            proto_pcr(),
        )
        .unwrap();
        let block = host.snapshot();
        assert_eq!(block.n_plugs(), PCR_MAX);
        assert_eq!(OutputPcr::unpack(block.quadlet(PCR_MAX).unwrap()), proto_pcr());
    }

    #[test]
    fn test_local_reads_loop_back() {
        let bus = bus();
        let mpr = OutputMpr { n_plugs: 2, bcast_channel: 63, ..Default::default() };
        let _host = host_outputs(bus.clone(), mpr, proto_pcr()).unwrap();

        let retrier = TransactionRetrier::packed(RetryPolicy::default());
        let plugs = PlugClient::new(bus.as_ref(), &retrier);
        assert_eq!(plugs.output_mpr(NodeId::local(0)).unwrap(), mpr);
        assert_eq!(plugs.output_pcr(NodeId::local(0), 1).unwrap(), proto_pcr());
        assert_eq!(plugs.output_pcr(NodeId::local(0), 2).unwrap(), OutputPcr::default());
    }

    #[test]
    fn test_compare_swap_with_matching_value() {
        let bus = bus();
        let host = host_outputs(bus.clone(), OutputMpr { n_plugs: 1, ..Default::default() }, proto_pcr()).unwrap();
        let current = proto_pcr().pack();
        let connected = OutputPcr { n_p2p_connections: 1, ..proto_pcr() }.pack();

        let offset = CSR_REGISTER_BASE + csr::OUTPUT_PCR_0;
        let ack = bus.deliver_request(&lock_request(offset, ExtendedCode::CompareSwap, current, connected));
        assert_eq!(ack, Some(AckCode::Complete));
        assert_eq!(host.snapshot().quadlet(1), Some(connected));

        let sent = bus.take_sent();
        let header = ResponseHeader::decode(&sent[0]).unwrap();
        assert_eq!(header.rcode, ResponseCode::Complete);
        assert_eq!(header.tcode, tcode::LOCK_RESPONSE);
        assert_eq!(header.destination, NodeId::local(1));
        assert_eq!(header.tlabel, 3);
        assert_eq!(header.lock_data_length(), 4);
        assert_eq!(payload(&sent[0]), current);
    }

    #[test]
    fn test_compare_swap_with_stale_value() {
        let bus = bus();
        let host = host_outputs(bus.clone(), OutputMpr { n_plugs: 1, ..Default::default() }, proto_pcr()).unwrap();
        let current = proto_pcr().pack();

        let offset = CSR_REGISTER_BASE + csr::OUTPUT_PCR_0;
        bus.deliver_request(&lock_request(offset, ExtendedCode::CompareSwap, current ^ 1, 0));
        assert_eq!(host.snapshot().quadlet(1), Some(current));
        assert_eq!(payload(&bus.take_sent()[0]), current);
    }

    #[test]
    fn test_other_lock_codes_get_type_error() {
        let bus = bus();
        let host = host_inputs(bus.clone(), InputMpr { n_plugs: 1, ..Default::default() }, InputPcr::default()).unwrap();
        let before = host.snapshot();

        let offset = CSR_REGISTER_BASE + csr::INPUT_PCR_0;
        bus.deliver_request(&lock_request(offset, ExtendedCode::FetchAdd, 0, 1));
        let sent = bus.take_sent();
        assert_eq!(sent[0].len(), 16);
        let header = ResponseHeader::decode(&sent[0]).unwrap();
        assert_eq!(header.rcode, ResponseCode::TypeError);
        assert_eq!(header.lock_data_length(), 0);
        assert_eq!(host.snapshot(), before);
    }

    #[test]
    fn test_block_requests_refused() {
        let bus = bus();
        let _host = host_outputs(bus.clone(), OutputMpr::default(), proto_pcr()).unwrap();
        let mut request = lock_request(CSR_REGISTER_BASE + csr::OUTPUT_MPR, ExtendedCode::CompareSwap, 0, 0);
        request.requested_length = 8;
        assert_eq!(bus.deliver_request(&request), Some(AckCode::Other(AckCode::TYPE_ERROR)));
        assert!(bus.take_sent().is_empty());
    }

    #[test]
    fn test_misaligned_read_gets_address_error() {
        let bus = bus();
        let _host = host_outputs(bus.clone(), OutputMpr::default(), proto_pcr()).unwrap();
        let request = ArmRequest {
            tcode: tcode::READ_QUADLET,
            request_type: ArmRequestType::Read,
            buffer: Vec::new(),
            ..lock_request(CSR_REGISTER_BASE + csr::OUTPUT_MPR + 2, ExtendedCode::Other(0), 0, 0)
        };
        bus.deliver_request(&request);
        let header = ResponseHeader::decode(&bus.take_sent()[0]).unwrap();
        assert_eq!(header.rcode, ResponseCode::AddressError);
        assert_eq!(header.tcode, tcode::READ_QUADLET_RESPONSE);
    }

    #[test]
    fn test_inputs_and_outputs_are_independent() {
        let bus = bus();
        let outputs = host_outputs(bus.clone(), OutputMpr { n_plugs: 3, ..Default::default() }, proto_pcr()).unwrap();
        let inputs = host_inputs(bus.clone(), InputMpr { n_plugs: 1, ..Default::default() }, InputPcr::default()).unwrap();
        assert_eq!(outputs.snapshot().n_plugs(), 3);
        assert_eq!(inputs.snapshot().n_plugs(), 1);
        assert!(host_outputs(bus.clone(), OutputMpr::default(), proto_pcr()).is_err());

        outputs.unregister().unwrap();
        let retrier = TransactionRetrier::packed(RetryPolicy::default());
        let addr = BusAddress::csr(NodeId::local(0), csr::OUTPUT_MPR);
        assert_eq!(retrier.read_quadlet(bus.as_ref(), addr).unwrap(), 0);

        drop(inputs);
        assert!(host_inputs(bus.clone(), InputMpr::default(), InputPcr::default()).is_ok());
    }
}

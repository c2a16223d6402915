//! In-process simulated bus
//!
//! Holds the address space of every simulated node, hosted ranges of the
//! local node and the FCP listener. Reads and locks against a range hosted by
//! the local node loop back through its handler and are answered from the
//! response packet the handler sends, so hosted registers can be exercised
//! end to end without hardware.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use avbus_core::codes::tcode;
use avbus_core::directory::{encode_text_leaf, key, BUS_ID_1394};
use avbus_core::{
    AckCode, ArmRequest, ArmRequestType, BusAddress, DirectoryEntry, ExtendedCode, NodeId,
    PackedStatus, ResponseCode, ResponseHeader, CSR_CONFIG_ROM, CSR_REGISTER_BASE,
};
use tracing::{debug, trace};

use crate::avc::AvcResponse;
use crate::bus::{ArmHandler, Bus, FcpHandler, PortInfo};
use crate::fcp::FCP_COMMAND_ADDR;

/// Status convention the simulated stack reports in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimAbi {
    #[default]
    Packed,
    Errno,
}

/// How a simulated node answers AV/C commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimAvc {
    pub reply: AvcResponse,
    pub interim_first: bool,
    /// Commands to swallow before answering
    pub unanswered: u32,
}

impl SimAvc {
    pub fn replying(reply: AvcResponse) -> Self {
        Self {
            reply,
            interim_first: false,
            unanswered: 0,
        }
    }

    pub fn with_interim(mut self) -> Self {
        self.interim_first = true;
        self
    }

    pub fn unanswered(mut self, commands: u32) -> Self {
        self.unanswered = commands;
        self
    }

    fn respond(&mut self, command: &[u8]) -> Vec<Vec<u8>> {
        if self.unanswered > 0 {
            self.unanswered -= 1;
            return Vec::new();
        }
        let with_code = |code: AvcResponse| {
            let mut frame = command.to_vec();
            if let Some(first) = frame.first_mut() {
                *first = (*first & 0xF0) | code.code();
            }
            frame
        };
        let mut frames = Vec::new();
        if self.interim_first {
            frames.push(with_code(AvcResponse::Interim));
        }
        frames.push(with_code(self.reply));
        frames
    }
}

/// Address space and behaviour of one simulated node
#[derive(Debug, Clone, Default)]
pub struct SimNode {
    memory: BTreeMap<u64, u32>,
    avc: Option<SimAvc>,
}

impl SimNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quadlet(mut self, offset: u64, value: u32) -> Self {
        self.memory.insert(offset, value);
        self
    }

    pub fn with_quadlets(mut self, offset: u64, values: &[u32]) -> Self {
        for (i, &value) in values.iter().enumerate() {
            self.memory.insert(offset + 4 * i as u64, value);
        }
        self
    }

    /// Load a configuration ROM image at the standard location
    pub fn with_rom(self, rom: &[u32]) -> Self {
        self.with_quadlets(CSR_REGISTER_BASE + CSR_CONFIG_ROM, rom)
    }

    pub fn with_avc(mut self, avc: SimAvc) -> Self {
        self.avc = Some(avc);
        self
    }

    pub fn quadlet(&self, offset: u64) -> u32 {
        self.memory.get(&offset).copied().unwrap_or(0)
    }
}

struct HostedRange {
    start: u64,
    length: u64,
    handler: Arc<dyn ArmHandler>,
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<u8, SimNode>,
    ranges: Vec<HostedRange>,
    fcp: Option<Arc<dyn FcpHandler>>,
    sent: Vec<Vec<u8>>,
    acks: VecDeque<AckCode>,
    reads: Vec<BusAddress>,
    tlabel: u8,
}

impl SimState {
    fn hosted(&self, offset: u64) -> Option<Arc<dyn ArmHandler>> {
        self.ranges
            .iter()
            .find(|r| offset >= r.start && offset < r.start + r.length)
            .map(|r| Arc::clone(&r.handler))
    }

    fn next_tlabel(&mut self) -> u8 {
        let tlabel = self.tlabel;
        self.tlabel = (self.tlabel + 1) & 0x3F;
        tlabel
    }

    fn node_mut(&mut self, node: NodeId) -> io::Result<&mut SimNode> {
        self.nodes
            .get_mut(&node.phy())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no node {}", node)))
    }
}

pub struct SimBus {
    local: NodeId,
    abi: SimAbi,
    state: Mutex<SimState>,
}

impl SimBus {
    /// Empty bus whose local node has physical id `local_phy`
    pub fn new(local_phy: u8) -> Self {
        let mut state = SimState::default();
        state.nodes.insert(local_phy, SimNode::new());
        Self {
            local: NodeId::local(local_phy),
            abi: SimAbi::default(),
            state: Mutex::new(state),
        }
    }

    pub fn with_node(self, phy: u8, node: SimNode) -> Self {
        self.state().nodes.insert(phy, node);
        self
    }

    pub fn with_abi(mut self, abi: SimAbi) -> Self {
        self.abi = abi;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue acknowledgements returned by the next transactions, one each,
    /// before the transaction touches memory
    pub fn script_acks(&self, acks: impl IntoIterator<Item = AckCode>) {
        self.state().acks.extend(acks);
    }

    /// Addresses of all read attempts so far
    pub fn read_log(&self) -> Vec<BusAddress> {
        self.state().reads.clone()
    }

    pub fn clear_read_log(&self) {
        self.state().reads.clear();
    }

    /// Drain the packets sent with `send_async`
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().sent)
    }

    pub fn peek(&self, phy: u8, offset: u64) -> Option<u32> {
        self.state().nodes.get(&phy).map(|n| n.quadlet(offset))
    }

    pub fn poke(&self, phy: u8, offset: u64, value: u32) {
        self.state()
            .nodes
            .entry(phy)
            .or_default()
            .memory
            .insert(offset, value);
    }

    pub fn fcp_listening(&self) -> bool {
        self.state().fcp.is_some()
    }

    /// Hand a frame to the FCP listener as if `source` had written it
    pub fn deliver_fcp(&self, source: NodeId, response: bool, data: &[u8]) {
        let handler = self.state().fcp.clone();
        if let Some(handler) = handler {
            handler.on_frame(source, response, data);
        }
    }

    /// Hand a request to the hosted range it targets, as a remote node would
    pub fn deliver_request(&self, request: &ArmRequest) -> Option<AckCode> {
        let handler = self.state().hosted(request.destination_offset)?;
        Some(handler.handle(self, request))
    }

    fn status(&self, ack: AckCode) -> io::Result<u32> {
        match self.abi {
            SimAbi::Packed => Ok(PackedStatus::new(ack, ResponseCode::Complete).0),
            SimAbi::Errno if ack.is_busy() => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            SimAbi::Errno if ack.is_success() => Ok(0),
            SimAbi::Errno => Err(io::Error::other(format!("transaction failed with {}", ack))),
        }
    }

    /// Pop the next scripted acknowledgement if it is not a plain completion
    fn scripted(&self, state: &mut SimState) -> Option<io::Result<u32>> {
        match state.acks.pop_front() {
            Some(AckCode::Complete) | None => None,
            Some(ack) => Some(self.status(ack)),
        }
    }

    fn local_request(
        &self,
        state: &mut SimState,
        addr: BusAddress,
        request_type: ArmRequestType,
        tcode: u8,
        extended_code: ExtendedCode,
        buffer: Vec<u8>,
    ) -> ArmRequest {
        ArmRequest {
            source: self.local,
            destination: self.local,
            tlabel: state.next_tlabel(),
            tcode,
            extended_code,
            destination_offset: addr.offset(),
            request_type,
            requested_length: 4,
            buffer,
        }
    }

    /// Run a request through a hosted handler and return its response packet
    fn loopback(&self, handler: Arc<dyn ArmHandler>, request: &ArmRequest) -> io::Result<(ResponseHeader, Vec<u8>)> {
        let sent_before = self.state().sent.len();
        let ack = handler.handle(self, request);
        if !ack.is_success() {
            return Err(io::Error::other(format!("hosted range answered {}", ack)));
        }
        let packet = self
            .state()
            .sent
            .get(sent_before)
            .cloned()
            .ok_or_else(|| io::Error::other("hosted range sent no response"))?;
        let header =
            ResponseHeader::decode(&packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if header.rcode != ResponseCode::Complete {
            return Err(io::Error::other(format!("hosted range responded {:?}", header.rcode)));
        }
        Ok((header, packet))
    }
}

impl Bus for SimBus {
    fn read(&self, addr: BusAddress, buf: &mut [u8]) -> io::Result<u32> {
        if buf.len() % 4 != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "read length not quadlet aligned"));
        }
        let mut state = self.state();
        state.reads.push(addr);
        if let Some(status) = self.scripted(&mut state) {
            return status;
        }

        if addr.node() == self.local {
            if let Some(handler) = state.hosted(addr.offset()) {
                if buf.len() != 4 {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "hosted ranges answer quadlet reads only"));
                }
                let request = self.local_request(
                    &mut state,
                    addr,
                    ArmRequestType::Read,
                    tcode::READ_QUADLET,
                    ExtendedCode::Other(0),
                    Vec::new(),
                );
                drop(state);
                let (header, _) = self.loopback(handler, &request)?;
                buf[..4].copy_from_slice(&header.quadlet3.to_be_bytes());
                return self.status(AckCode::Complete);
            }
        }

        let node = state.node_mut(addr.node())?;
        for (i, chunk) in buf.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&node.quadlet(addr.offset() + 4 * i as u64).to_be_bytes());
        }
        trace!(addr = %addr, len = buf.len(), "Simulated read");
        self.status(AckCode::Complete)
    }

    fn write(&self, addr: BusAddress, data: &[u8]) -> io::Result<u32> {
        if data.len() % 4 != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "write length not quadlet aligned"));
        }
        let mut state = self.state();
        if let Some(status) = self.scripted(&mut state) {
            return status;
        }
        let node = state.node_mut(addr.node())?;
        for (i, chunk) in data.chunks_exact(4).enumerate() {
            let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            node.memory.insert(addr.offset() + 4 * i as u64, value);
        }
        let responses = match (addr.offset(), node.avc.as_mut()) {
            (FCP_COMMAND_ADDR, Some(avc)) => avc.respond(data),
            _ => Vec::new(),
        };
        let listener = state.fcp.clone();
        drop(state);

        if let Some(listener) = listener {
            for frame in responses {
                listener.on_frame(addr.node(), true, &frame);
            }
        }
        self.status(AckCode::Complete)
    }

    fn lock(
        &self,
        addr: BusAddress,
        code: ExtendedCode,
        data: u32,
        arg: u32,
        old: &mut u32,
    ) -> io::Result<u32> {
        let mut state = self.state();
        if let Some(status) = self.scripted(&mut state) {
            return status;
        }

        if addr.node() == self.local {
            if let Some(handler) = state.hosted(addr.offset()) {
                let mut buffer = arg.to_be_bytes().to_vec();
                buffer.extend_from_slice(&data.to_be_bytes());
                let request = self.local_request(
                    &mut state,
                    addr,
                    ArmRequestType::Lock,
                    tcode::LOCK_REQUEST,
                    code,
                    buffer,
                );
                drop(state);
                let (header, packet) = self.loopback(handler, &request)?;
                let payload = packet.get(16..20).filter(|_| header.lock_data_length() == 4);
                let payload = payload
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "lock response without data"))?;
                *old = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                return self.status(AckCode::Complete);
            }
        }

        if code != ExtendedCode::CompareSwap {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("lock code {:?} not simulated", code),
            ));
        }
        let node = state.node_mut(addr.node())?;
        *old = node.quadlet(addr.offset());
        if *old == arg {
            node.memory.insert(addr.offset(), data);
        }
        debug!(addr = %addr, old = *old, new = data, swapped = *old == arg, "Simulated compare-swap");
        self.status(AckCode::Complete)
    }

    fn send_async(&self, packet: &[u8]) -> io::Result<()> {
        self.state().sent.push(packet.to_vec());
        Ok(())
    }

    fn register_range(&self, start: u64, length: usize, handler: Arc<dyn ArmHandler>) -> io::Result<()> {
        let mut state = self.state();
        let length = length as u64;
        if state
            .ranges
            .iter()
            .any(|r| start < r.start + r.length && r.start < start + length)
        {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("range {:#x} overlaps a hosted range", start),
            ));
        }
        state.ranges.push(HostedRange { start, length, handler });
        Ok(())
    }

    fn unregister_range(&self, start: u64) -> io::Result<()> {
        let mut state = self.state();
        let before = state.ranges.len();
        state.ranges.retain(|r| r.start != start);
        if state.ranges.len() == before {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no hosted range at {:#x}", start),
            ));
        }
        Ok(())
    }

    fn start_fcp_listen(&self, handler: Arc<dyn FcpHandler>) -> io::Result<()> {
        self.state().fcp = Some(handler);
        Ok(())
    }

    fn stop_fcp_listen(&self) -> io::Result<()> {
        self.state().fcp = None;
        Ok(())
    }

    fn node_count(&self) -> usize {
        self.state()
            .nodes
            .keys()
            .next_back()
            .map_or(0, |&phy| phy as usize + 1)
    }

    fn local_id(&self) -> NodeId {
        self.local
    }

    fn ports(&self) -> io::Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "sim0".to_string(),
            nodes: self.node_count(),
        }])
    }

    fn set_port(&self, port: usize) -> io::Result<()> {
        if port == 0 {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, format!("no port {}", port)))
        }
    }
}

/// Directory content of a configuration ROM image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RomEntry {
    Immediate(u8, u32),
    Text(String),
    Directory(u8, Vec<RomEntry>),
}

/// Lays out a configuration ROM image: bus information block, root
/// directory, then every leaf and sub-directory after the directory that
/// references it
#[derive(Debug, Clone)]
pub struct RomBuilder {
    guid: u64,
    bus_options: u32,
    root: Vec<RomEntry>,
}

impl RomBuilder {
    pub fn new(guid: u64) -> Self {
        Self {
            guid,
            bus_options: 0xE064_A002,
            root: Vec::new(),
        }
    }

    pub fn bus_options(mut self, options: u32) -> Self {
        self.bus_options = options;
        self
    }

    pub fn entry(mut self, entry: RomEntry) -> Self {
        self.root.push(entry);
        self
    }

    pub fn immediate(self, key: u8, value: u32) -> Self {
        self.entry(RomEntry::Immediate(key, value))
    }

    pub fn text(self, text: &str) -> Self {
        self.entry(RomEntry::Text(text.to_string()))
    }

    /// Unit directory advertising a protocol
    pub fn unit(self, spec_id: u32, sw_version: u32) -> Self {
        self.entry(RomEntry::Directory(
            key::UNIT_DIRECTORIES[2],
            vec![
                RomEntry::Immediate(key::UNIT_SPEC_ID, spec_id),
                RomEntry::Immediate(key::UNIT_SW_VERSION, sw_version),
            ],
        ))
    }

    pub fn build(&self) -> Vec<u32> {
        let mut rom = vec![
            4 << 24,
            BUS_ID_1394,
            self.bus_options,
            (self.guid >> 32) as u32,
            self.guid as u32,
        ];
        emit_directory(&mut rom, &self.root);
        rom
    }
}

fn emit_directory(rom: &mut Vec<u32>, entries: &[RomEntry]) {
    let base = rom.len();
    rom.push((entries.len() as u32) << 16);
    rom.resize(base + 1 + entries.len(), 0);
    for (i, entry) in entries.iter().enumerate() {
        let slot = base + 1 + i;
        let target = rom.len();
        let quadlet = match entry {
            RomEntry::Immediate(key, value) => DirectoryEntry { key: *key, value: *value }.to_quadlet(),
            RomEntry::Text(text) => {
                rom.extend(encode_text_leaf(text));
                DirectoryEntry {
                    key: key::TEXTUAL_DESCRIPTOR,
                    value: (target - slot) as u32,
                }
                .to_quadlet()
            }
            RomEntry::Directory(key, children) => {
                emit_directory(rom, children);
                DirectoryEntry {
                    key: *key,
                    value: (target - slot) as u32,
                }
                .to_quadlet()
            }
        };
        rom[slot] = quadlet;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{BusError, RetryPolicy, TransactionRetrier};

    #[test]
    fn test_scripted_busy_then_complete() {
        let bus = SimBus::new(0).with_node(1, SimNode::new().with_quadlet(0x1000, 7));
        bus.script_acks([AckCode::BusyX, AckCode::BusyB]);
        let retrier = TransactionRetrier::packed(RetryPolicy { max_attempts: 4, delay_ms: 0 });
        let value = retrier
            .read_quadlet(&bus, BusAddress::new(NodeId::local(1), 0x1000))
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(bus.read_log().len(), 3);

        bus.clear_read_log();
        retrier
            .read_quadlet(&bus, BusAddress::new(NodeId::local(1), 0x1000))
            .unwrap();
        assert_eq!(bus.read_log().len(), 1);
    }

    #[test]
    fn test_errno_abi_busy() {
        let bus = SimBus::new(0).with_abi(SimAbi::Errno).with_node(1, SimNode::new());
        bus.script_acks([AckCode::BusyA; 3]);
        let retrier = TransactionRetrier::errno(RetryPolicy { max_attempts: 3, delay_ms: 0 });
        let result = retrier.read_quadlet(&bus, BusAddress::new(NodeId::local(1), 0));
        assert!(matches!(result, Err(BusError::Exhausted { attempts: 3 })));
    }

    #[test]
    fn test_missing_node_is_io_error() {
        let bus = SimBus::new(0);
        let retrier = TransactionRetrier::default();
        let result = retrier.read_quadlet(&bus, BusAddress::new(NodeId::local(5), 0));
        assert!(matches!(result, Err(BusError::Io(_))));
    }

    #[test]
    fn test_remote_compare_swap() {
        let bus = SimBus::new(0).with_node(1, SimNode::new().with_quadlet(0x10, 5));
        let addr = BusAddress::new(NodeId::local(1), 0x10);
        let mut old = 0;
        bus.lock(addr, ExtendedCode::CompareSwap, 9, 4, &mut old).unwrap();
        assert_eq!((old, bus.peek(1, 0x10)), (5, Some(5)));
        bus.lock(addr, ExtendedCode::CompareSwap, 9, 5, &mut old).unwrap();
        assert_eq!((old, bus.peek(1, 0x10)), (5, Some(9)));
    }

    #[test]
    fn test_rom_layout() {
        let rom = RomBuilder::new(0x0011_2233_4455_6677)
            .immediate(key::VENDOR_ID, 0x1234)
            .text("Acme")
            .build();
        assert_eq!(rom[1], BUS_ID_1394);
        assert_eq!(rom[5], 2 << 16);
        assert_eq!(rom[6], 0x0300_1234);
        // Leaf directly follows the two entries
        assert_eq!(rom[7], 0x8100_0001);
        assert_eq!(rom[8] >> 16, 4);
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        struct Nop;
        impl ArmHandler for Nop {
            fn handle(&self, _bus: &dyn Bus, _request: &ArmRequest) -> AckCode {
                AckCode::Complete
            }
        }
        let bus = SimBus::new(0);
        bus.register_range(0x1000, 128, Arc::new(Nop)).unwrap();
        let err = bus.register_range(0x1040, 4, Arc::new(Nop)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        bus.unregister_range(0x1000).unwrap();
        assert!(bus.unregister_range(0x1000).is_err());
    }
}

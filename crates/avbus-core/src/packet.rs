//! Asynchronous request/response packets exchanged with locally hosted ranges

use thiserror::Error;

use crate::codes::{tcode, ExtendedCode, ResponseCode};
use crate::node::NodeId;

/// Largest response packet the emulator ever builds, in quadlets
pub const RESPONSE_CAPACITY: usize = 8;

/// Header quadlets preceding the payload of a response
pub const HEADER_QUADLETS: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("Response packet full: capacity {capacity} quadlets")]
    CapacityExceeded { capacity: usize },
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),
}

/// Kind of access a remote node made to a hosted range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRequestType {
    Read,
    Write,
    Lock,
}

/// An inbound request against a locally hosted address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmRequest {
    /// Node that issued the request
    pub source: NodeId,
    /// Local node the request was addressed to
    pub destination: NodeId,
    pub tlabel: u8,
    pub tcode: u8,
    pub extended_code: ExtendedCode,
    pub destination_offset: u64,
    pub request_type: ArmRequestType,
    pub requested_length: usize,
    /// Request payload in wire order; for lock requests the argument
    /// quadlet followed by the data quadlet
    pub buffer: Vec<u8>,
}

impl ArmRequest {
    /// Big-endian quadlet `index` of the request payload
    pub fn payload_quadlet(&self, index: usize) -> Option<u32> {
        let start = index * 4;
        let bytes = self.buffer.get(start..start + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Response packet assembled in a fixed-capacity buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    quadlets: [u32; RESPONSE_CAPACITY],
    len: usize,
}

impl ResponsePacket {
    fn with_header(request: &ArmRequest, tcode: u8, rcode: ResponseCode) -> Self {
        let mut packet = Self {
            quadlets: [0; RESPONSE_CAPACITY],
            len: HEADER_QUADLETS,
        };
        packet.quadlets[0] = ((request.source.raw() as u32) << 16)
            | (((request.tlabel & 0x3F) as u32) << 10)
            | ((tcode as u32 & 0xF) << 4);
        packet.quadlets[1] =
            ((request.destination.raw() as u32) << 16) | ((rcode.raw() as u32 & 0xF) << 12);
        packet
    }

    /// Quadlet read response carrying `data`
    pub fn read_response(request: &ArmRequest, rcode: ResponseCode, data: u32) -> Self {
        let mut packet = Self::with_header(request, tcode::READ_QUADLET_RESPONSE, rcode);
        packet.quadlets[3] = data;
        packet
    }

    /// Lock response echoing the extended code; `old_value` is present only
    /// when the lock was performed
    pub fn lock_response(
        request: &ArmRequest,
        rcode: ResponseCode,
        old_value: Option<u32>,
    ) -> Result<Self, PacketError> {
        let mut packet = Self::with_header(request, tcode::LOCK_RESPONSE, rcode);
        let data_length: u32 = if old_value.is_some() { 4 } else { 0 };
        packet.quadlets[3] = (data_length << 16) | (request.extended_code.raw() as u32 & 0xFF);
        if let Some(old) = old_value {
            packet.push(old)?;
        }
        Ok(packet)
    }

    pub fn push(&mut self, quadlet: u32) -> Result<(), PacketError> {
        if self.len == RESPONSE_CAPACITY {
            return Err(PacketError::CapacityExceeded {
                capacity: RESPONSE_CAPACITY,
            });
        }
        self.quadlets[self.len] = quadlet;
        self.len += 1;
        Ok(())
    }

    pub fn quadlets(&self) -> &[u32] {
        &self.quadlets[..self.len]
    }

    pub fn byte_len(&self) -> usize {
        self.len * 4
    }

    /// Serialize in wire order
    pub fn to_bytes(&self) -> Vec<u8> {
        self.quadlets().iter().flat_map(|q| q.to_be_bytes()).collect()
    }
}

/// Decoded view of a response header, used by receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub destination: NodeId,
    pub tlabel: u8,
    pub tcode: u8,
    pub source: NodeId,
    pub rcode: ResponseCode,
    /// Fourth header quadlet: quadlet data for read responses,
    /// data length and extended code for lock responses
    pub quadlet3: u32,
}

impl ResponseHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_QUADLETS * 4 {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let q = |i: usize| {
            u32::from_be_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        let (q0, q1, q3) = (q(0), q(1), q(3));
        Ok(Self {
            destination: NodeId((q0 >> 16) as u16),
            tlabel: ((q0 >> 10) & 0x3F) as u8,
            tcode: ((q0 >> 4) & 0xF) as u8,
            source: NodeId((q1 >> 16) as u16),
            rcode: ResponseCode::from_raw(((q1 >> 12) & 0xF) as u16),
            quadlet3: q3,
        })
    }

    /// Data length field of a lock response
    pub fn lock_data_length(&self) -> usize {
        (self.quadlet3 >> 16) as usize
    }
}

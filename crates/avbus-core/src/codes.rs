//! Acknowledgement, response and transaction codes

use serde::{Deserialize, Serialize};

/// Link-layer acknowledgement returned for an asynchronous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckCode {
    Complete,
    Pending,
    BusyX,
    BusyA,
    BusyB,
    /// Transaction handled by the local node without touching the bus
    Local,
    Other(u16),
}

impl AckCode {
    pub const COMPLETE: u16 = 0x1;
    pub const PENDING: u16 = 0x2;
    pub const BUSY_X: u16 = 0x4;
    pub const BUSY_A: u16 = 0x5;
    pub const BUSY_B: u16 = 0x6;
    pub const DATA_ERROR: u16 = 0xD;
    pub const TYPE_ERROR: u16 = 0xE;
    pub const LOCAL: u16 = 0x10;

    pub fn from_raw(raw: u16) -> Self {
        match raw {
            Self::COMPLETE => Self::Complete,
            Self::PENDING => Self::Pending,
            Self::BUSY_X => Self::BusyX,
            Self::BUSY_A => Self::BusyA,
            Self::BUSY_B => Self::BusyB,
            Self::LOCAL => Self::Local,
            other => Self::Other(other),
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            Self::Complete => Self::COMPLETE,
            Self::Pending => Self::PENDING,
            Self::BusyX => Self::BUSY_X,
            Self::BusyA => Self::BUSY_A,
            Self::BusyB => Self::BUSY_B,
            Self::Local => Self::LOCAL,
            Self::Other(raw) => *raw,
        }
    }

    /// Busy acknowledgements are the only retryable class
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::BusyX | Self::BusyA | Self::BusyB)
    }

    /// Acknowledgements that terminate a transaction successfully
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete | Self::Pending | Self::Local)
    }
}

impl std::fmt::Display for AckCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "ack_complete"),
            Self::Pending => write!(f, "ack_pending"),
            Self::BusyX => write!(f, "ack_busy_x"),
            Self::BusyA => write!(f, "ack_busy_a"),
            Self::BusyB => write!(f, "ack_busy_b"),
            Self::Local => write!(f, "ack_local"),
            Self::Other(raw) => write!(f, "ack {:#x}", raw),
        }
    }
}

/// Response code carried in a response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Complete,
    ConflictError,
    DataError,
    TypeError,
    AddressError,
    Other(u16),
}

impl ResponseCode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0 => Self::Complete,
            0x4 => Self::ConflictError,
            0x5 => Self::DataError,
            0x6 => Self::TypeError,
            0x7 => Self::AddressError,
            other => Self::Other(other),
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            Self::Complete => 0x0,
            Self::ConflictError => 0x4,
            Self::DataError => 0x5,
            Self::TypeError => 0x6,
            Self::AddressError => 0x7,
            Self::Other(raw) => *raw,
        }
    }
}

/// Status word produced by the older bus-stack ABI: ack in the upper half,
/// response code in the lower half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedStatus(pub u32);

impl PackedStatus {
    pub fn new(ack: AckCode, rcode: ResponseCode) -> Self {
        Self(((ack.raw() as u32) << 16) | rcode.raw() as u32)
    }

    pub fn ack(&self) -> AckCode {
        AckCode::from_raw((self.0 >> 16) as u16)
    }

    pub fn rcode(&self) -> ResponseCode {
        ResponseCode::from_raw((self.0 & 0xFFFF) as u16)
    }
}

/// Transaction codes used in packet headers
pub mod tcode {
    pub const WRITE_QUADLET: u8 = 0x0;
    pub const WRITE_BLOCK: u8 = 0x1;
    pub const WRITE_RESPONSE: u8 = 0x2;
    pub const READ_QUADLET: u8 = 0x4;
    pub const READ_BLOCK: u8 = 0x5;
    pub const READ_QUADLET_RESPONSE: u8 = 0x6;
    pub const READ_BLOCK_RESPONSE: u8 = 0x7;
    pub const LOCK_REQUEST: u8 = 0x9;
    pub const LOCK_RESPONSE: u8 = 0xB;
}

/// Extended transaction codes for lock requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedCode {
    MaskSwap,
    CompareSwap,
    FetchAdd,
    LittleAdd,
    BoundedAdd,
    WrapAdd,
    Other(u16),
}

impl ExtendedCode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x1 => Self::MaskSwap,
            0x2 => Self::CompareSwap,
            0x3 => Self::FetchAdd,
            0x4 => Self::LittleAdd,
            0x5 => Self::BoundedAdd,
            0x6 => Self::WrapAdd,
            other => Self::Other(other),
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            Self::MaskSwap => 0x1,
            Self::CompareSwap => 0x2,
            Self::FetchAdd => 0x3,
            Self::LittleAdd => 0x4,
            Self::BoundedAdd => 0x5,
            Self::WrapAdd => 0x6,
            Self::Other(raw) => *raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_classes() {
        for raw in [AckCode::BUSY_X, AckCode::BUSY_A, AckCode::BUSY_B] {
            let ack = AckCode::from_raw(raw);
            assert!(ack.is_busy());
            assert!(!ack.is_success());
        }
        assert!(AckCode::from_raw(AckCode::LOCAL).is_success());
        assert!(AckCode::from_raw(AckCode::PENDING).is_success());
        assert_eq!(AckCode::from_raw(AckCode::TYPE_ERROR), AckCode::Other(0xE));
    }

    #[test]
    fn test_packed_status() {
        let status = PackedStatus::new(AckCode::BusyA, ResponseCode::AddressError);
        assert_eq!(status.0, 0x0005_0007);
        assert_eq!(status.ack(), AckCode::BusyA);
        assert_eq!(status.rcode(), ResponseCode::AddressError);
    }

    #[test]
    fn test_extended_code_raw() {
        assert_eq!(ExtendedCode::from_raw(2), ExtendedCode::CompareSwap);
        assert_eq!(ExtendedCode::FetchAdd.raw(), 3);
        assert_eq!(ExtendedCode::from_raw(9), ExtendedCode::Other(9));
    }
}

//! Plug control registers (IEC 61883-1)
//!
//! Every register is a single quadlet. Fields are described by explicit bit
//! ranges (bit 0 is the least significant bit) and converted with pure
//! pack/unpack functions, so the wire layout never depends on struct layout.

use serde::{Deserialize, Serialize};

/// Maximum number of PCRs of one direction within the standard address range
pub const PCR_MAX: usize = 31;

/// Quadlets in a hosted register block: one MPR plus `PCR_MAX` PCRs
pub const BLOCK_QUADLETS: usize = 1 + PCR_MAX;

/// CSR offsets of the plug registers
pub mod csr {
    pub const OUTPUT_MPR: u64 = 0x900;
    pub const OUTPUT_PCR_0: u64 = 0x904;
    pub const INPUT_MPR: u64 = 0x980;
    pub const INPUT_PCR_0: u64 = 0x984;
}

/// Broadcast channel value meaning "no channel"
pub const BROADCAST_CHANNEL_NONE: u8 = 63;

fn field(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1 << width) - 1)
}

fn put(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1u32 << width) - 1) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

/// Which side of a node a plug sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlugDirection {
    Output,
    Input,
}

impl PlugDirection {
    pub fn mpr_offset(&self) -> u64 {
        match self {
            Self::Output => csr::OUTPUT_MPR,
            Self::Input => csr::INPUT_MPR,
        }
    }

    /// CSR offset of PCR number `index`
    pub fn pcr_offset(&self, index: usize) -> u64 {
        self.mpr_offset() + 4 * (index as u64 + 1)
    }
}

impl std::fmt::Display for PlugDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Output => write!(f, "output"),
            Self::Input => write!(f, "input"),
        }
    }
}

/// Isochronous data rate field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRate {
    S100,
    S200,
    S400,
    Reserved,
}

impl DataRate {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::S100,
            1 => Self::S200,
            2 => Self::S400,
            _ => Self::Reserved,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Self::S100 => 0,
            Self::S200 => 1,
            Self::S400 => 2,
            Self::Reserved => 3,
        }
    }
}

impl Default for DataRate {
    fn default() -> Self {
        Self::S100
    }
}

/// Overhead id: 0 stands for 512 bandwidth units, n for n * 32
pub fn overhead_bandwidth(overhead_id: u8) -> u32 {
    match overhead_id & 0xF {
        0 => 512,
        n => n as u32 * 32,
    }
}

/// Output master plug register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMpr {
    /// bits 0..5
    pub n_plugs: u8,
    /// bits 8..16
    pub persistent_ext: u8,
    /// bits 16..24
    pub non_persistent_ext: u8,
    /// bits 24..30
    pub bcast_channel: u8,
    /// bits 30..32
    pub data_rate: DataRate,
}

impl OutputMpr {
    pub fn unpack(q: u32) -> Self {
        Self {
            n_plugs: field(q, 0, 5) as u8,
            persistent_ext: field(q, 8, 8) as u8,
            non_persistent_ext: field(q, 16, 8) as u8,
            bcast_channel: field(q, 24, 6) as u8,
            data_rate: DataRate::from_bits(field(q, 30, 2)),
        }
    }

    pub fn pack(&self) -> u32 {
        let mut q = 0;
        put(&mut q, 0, 5, self.n_plugs as u32);
        put(&mut q, 8, 8, self.persistent_ext as u32);
        put(&mut q, 16, 8, self.non_persistent_ext as u32);
        put(&mut q, 24, 6, self.bcast_channel as u32);
        put(&mut q, 30, 2, self.data_rate.bits());
        q
    }
}

/// Input master plug register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMpr {
    /// bits 0..5
    pub n_plugs: u8,
    /// bits 8..16
    pub persistent_ext: u8,
    /// bits 16..24
    pub non_persistent_ext: u8,
    /// bits 30..32
    pub data_rate: DataRate,
}

impl InputMpr {
    pub fn unpack(q: u32) -> Self {
        Self {
            n_plugs: field(q, 0, 5) as u8,
            persistent_ext: field(q, 8, 8) as u8,
            non_persistent_ext: field(q, 16, 8) as u8,
            data_rate: DataRate::from_bits(field(q, 30, 2)),
        }
    }

    pub fn pack(&self) -> u32 {
        let mut q = 0;
        put(&mut q, 0, 5, self.n_plugs as u32);
        put(&mut q, 8, 8, self.persistent_ext as u32);
        put(&mut q, 16, 8, self.non_persistent_ext as u32);
        put(&mut q, 30, 2, self.data_rate.bits());
        q
    }
}

/// Output plug control register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPcr {
    /// bits 0..10, quadlets per isochronous packet
    pub payload: u16,
    /// bits 10..14
    pub overhead_id: u8,
    /// bits 14..16
    pub data_rate: DataRate,
    /// bits 16..22
    pub channel: u8,
    /// bits 24..30
    pub n_p2p_connections: u8,
    /// bit 30
    pub bcast_connection: bool,
    /// bit 31
    pub online: bool,
}

impl OutputPcr {
    pub fn unpack(q: u32) -> Self {
        Self {
            payload: field(q, 0, 10) as u16,
            overhead_id: field(q, 10, 4) as u8,
            data_rate: DataRate::from_bits(field(q, 14, 2)),
            channel: field(q, 16, 6) as u8,
            n_p2p_connections: field(q, 24, 6) as u8,
            bcast_connection: field(q, 30, 1) != 0,
            online: field(q, 31, 1) != 0,
        }
    }

    pub fn pack(&self) -> u32 {
        let mut q = 0;
        put(&mut q, 0, 10, self.payload as u32);
        put(&mut q, 10, 4, self.overhead_id as u32);
        put(&mut q, 14, 2, self.data_rate.bits());
        put(&mut q, 16, 6, self.channel as u32);
        put(&mut q, 24, 6, self.n_p2p_connections as u32);
        put(&mut q, 30, 1, self.bcast_connection as u32);
        put(&mut q, 31, 1, self.online as u32);
        q
    }
}

/// Input plug control register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPcr {
    /// bits 16..22
    pub channel: u8,
    /// bits 24..30
    pub n_p2p_connections: u8,
    /// bit 30
    pub bcast_connection: bool,
    /// bit 31
    pub online: bool,
}

impl InputPcr {
    pub fn unpack(q: u32) -> Self {
        Self {
            channel: field(q, 16, 6) as u8,
            n_p2p_connections: field(q, 24, 6) as u8,
            bcast_connection: field(q, 30, 1) != 0,
            online: field(q, 31, 1) != 0,
        }
    }

    pub fn pack(&self) -> u32 {
        let mut q = 0;
        put(&mut q, 16, 6, self.channel as u32);
        put(&mut q, 24, 6, self.n_p2p_connections as u32);
        put(&mut q, 30, 1, self.bcast_connection as u32);
        put(&mut q, 31, 1, self.online as u32);
        q
    }
}

/// In-memory register block: the MPR quadlet followed by `PCR_MAX` PCR quadlets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    words: [u32; BLOCK_QUADLETS],
}

impl RegisterBlock {
    /// Build an output block, clamping the plug count to `PCR_MAX` and
    /// initialising every active PCR from the prototype
    pub fn outputs(proto_mpr: OutputMpr, proto_pcr: OutputPcr) -> Self {
        let n_plugs = (proto_mpr.n_plugs as usize).min(PCR_MAX);
        let mpr = OutputMpr {
            n_plugs: n_plugs as u8,
            ..proto_mpr
        };
        Self::from_prototype(mpr.pack(), n_plugs, proto_pcr.pack())
    }

    pub fn inputs(proto_mpr: InputMpr, proto_pcr: InputPcr) -> Self {
        let n_plugs = (proto_mpr.n_plugs as usize).min(PCR_MAX);
        let mpr = InputMpr {
            n_plugs: n_plugs as u8,
            ..proto_mpr
        };
        Self::from_prototype(mpr.pack(), n_plugs, proto_pcr.pack())
    }

    fn from_prototype(mpr: u32, n_plugs: usize, pcr: u32) -> Self {
        let mut words = [0u32; BLOCK_QUADLETS];
        words[0] = mpr;
        for word in words.iter_mut().skip(1).take(n_plugs) {
            *word = pcr;
        }
        Self { words }
    }

    pub fn quadlet(&self, index: usize) -> Option<u32> {
        self.words.get(index).copied()
    }

    pub fn set_quadlet(&mut self, index: usize, value: u32) -> bool {
        match self.words.get_mut(index) {
            Some(word) => {
                *word = value;
                true
            }
            None => false,
        }
    }

    pub fn mpr(&self) -> u32 {
        self.words[0]
    }

    /// Active plug count as recorded in the MPR
    pub fn n_plugs(&self) -> usize {
        field(self.words[0], 0, 5) as usize
    }

    pub fn size_bytes() -> usize {
        BLOCK_QUADLETS * 4
    }
}

//! Configuration ROM directory model
//!
//! A node's configuration ROM is a tree of 32-bit entries. Each entry packs
//! an 8-bit key with a 24-bit value; the key decides whether the value is an
//! immediate, an offset to a text leaf, or an offset to a sub-directory.
//! This module holds the decoded result of a walk together with the pure
//! decoding helpers; the walk itself lives in the transport crate.

use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;
use tracing::warn;

/// Byte offsets of the bus information block, relative to the ROM base
pub mod rom_offset {
    pub const HEADER: u64 = 0x00;
    pub const BUS_ID: u64 = 0x04;
    pub const BUS_OPTIONS: u64 = 0x08;
    pub const GUID_HI: u64 = 0x0C;
    pub const GUID_LO: u64 = 0x10;
    pub const ROOT_DIRECTORY: u64 = 0x14;
}

/// "1394" in ASCII
pub const BUS_ID_1394: u32 = 0x3133_3934;

/// Entry keys the parser understands
pub mod key {
    pub const VENDOR_ID: u8 = 0x03;
    pub const NODE_CAPABILITIES: u8 = 0x0C;
    pub const UNIT_SPEC_ID: u8 = 0x12;
    pub const UNIT_SW_VERSION: u8 = 0x13;
    pub const MODEL_ID: u8 = 0x17;
    pub const TEXTUAL_DESCRIPTOR: u8 = 0x81;
    pub const TEXTUAL_DESCRIPTOR_ALT: u8 = 0x82;
    pub const UNIT_DIRECTORIES: [u8; 5] = [0xC3, 0xC7, 0xD1, 0xD4, 0xD8];
}

/// Longest text leaf payload accepted, in bytes
pub const MAX_LEAF_BYTES: usize = 256;

/// Fixed leaf overhead in quadlets: language and character set specifiers
pub const LEAF_OVERHEAD_QUADLETS: usize = 2;

/// Character set specifier for the Microsoft-style 16-bit US English set
pub const CHARSET_MS_US_ENGLISH: u32 = 0x409;

/// One key/value entry of a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub key: u8,
    pub value: u32,
}

impl DirectoryEntry {
    pub fn from_quadlet(quadlet: u32) -> Self {
        Self {
            key: (quadlet >> 24) as u8,
            value: quadlet & 0x00FF_FFFF,
        }
    }

    pub fn to_quadlet(&self) -> u32 {
        ((self.key as u32) << 24) | (self.value & 0x00FF_FFFF)
    }

    pub fn kind(&self) -> EntryKind {
        match self.key {
            key::NODE_CAPABILITIES
            | key::VENDOR_ID
            | key::UNIT_SPEC_ID
            | key::UNIT_SW_VERSION
            | key::MODEL_ID => EntryKind::Immediate,
            key::TEXTUAL_DESCRIPTOR | key::TEXTUAL_DESCRIPTOR_ALT => EntryKind::TextLeaf,
            k if key::UNIT_DIRECTORIES.contains(&k) => EntryKind::Directory,
            _ => EntryKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Immediate,
    TextLeaf,
    Directory,
    Unknown,
}

/// Entry count stored in the upper half of a directory header
pub fn directory_length(header: u32) -> usize {
    (header >> 16) as usize
}

/// Character set a text leaf was encoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterSet {
    /// Minimal ASCII, four characters per quadlet
    Ascii,
    /// 16-bit code units, two per quadlet
    MsUsEnglish,
}

impl CharacterSet {
    /// Map a character set specifier quadlet; unknown sets fall back to ASCII
    pub fn from_specifier(spec: u32) -> Self {
        match spec {
            0 => Self::Ascii,
            CHARSET_MS_US_ENGLISH => Self::MsUsEnglish,
            other => {
                warn!(charset = format_args!("{:#x}", other), "Unimplemented character set for textual leaf");
                Self::Ascii
            }
        }
    }

    pub fn specifier(&self) -> u32 {
        match self {
            Self::Ascii => 0,
            Self::MsUsEnglish => CHARSET_MS_US_ENGLISH,
        }
    }
}

/// A decoded textual descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextLeaf {
    pub text: String,
    pub charset: CharacterSet,
}

/// Payload length in bytes declared by a leaf header, if it is in range
pub fn leaf_byte_length(header: u32) -> Option<usize> {
    let words = (header >> 16) as usize;
    let bytes = words.checked_sub(LEAF_OVERHEAD_QUADLETS)? * 4;
    if bytes == 0 || bytes > MAX_LEAF_BYTES {
        return None;
    }
    Some(bytes)
}

/// Decode leaf payload quadlets into text.
///
/// ASCII leaves carry four characters per big-endian quadlet. 16-bit leaves
/// carry two code units per quadlet, each stored low byte first, and only the
/// low byte of each unit is kept. Decoding stops at the first NUL so padding
/// is dropped, and never produces more than `byte_length` characters.
pub fn decode_leaf_text(charset: CharacterSet, payload: &[u32], byte_length: usize) -> String {
    let mut bytes = Vec::with_capacity(byte_length);
    'quadlets: for quadlet in payload {
        let raw = quadlet.to_be_bytes();
        let wide = [raw[0], raw[2]];
        let chars: &[u8] = match charset {
            CharacterSet::Ascii => &raw,
            CharacterSet::MsUsEnglish => &wide,
        };
        for &c in chars {
            if c == 0 || bytes.len() == byte_length {
                break 'quadlets;
            }
            bytes.push(c);
        }
    }
    bytes.iter().map(|&b| b as char).collect()
}

/// Encode text into leaf quadlets: header, language, charset, NUL-padded payload
pub fn encode_text_leaf(text: &str) -> Vec<u32> {
    let bytes = text.as_bytes();
    let payload_quadlets = bytes.len() / 4 + 1;
    let mut leaf = Vec::with_capacity(payload_quadlets + 3);
    leaf.push(((payload_quadlets + LEAF_OVERHEAD_QUADLETS) as u32) << 16);
    leaf.push(0);
    leaf.push(CharacterSet::Ascii.specifier());
    for chunk in 0..payload_quadlets {
        let mut quad = [0u8; 4];
        for (i, slot) in quad.iter_mut().enumerate() {
            if let Some(&b) = bytes.get(chunk * 4 + i) {
                *slot = b;
            }
        }
        leaf.push(u32::from_be_bytes(quad));
    }
    leaf
}

/// Result of walking a node's configuration ROM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDirectory {
    pub node_capabilities: u32,
    pub vendor_id: u32,
    pub unit_spec_id: u32,
    pub unit_sw_version: u32,
    pub model_id: u32,
    pub leaves: Vec<TextLeaf>,
    /// All leaves joined by single spaces, absent when there are none
    pub label: Option<String>,
}

impl ConfigDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an immediate entry; returns false for keys that are not immediates
    pub fn apply_immediate(&mut self, entry: DirectoryEntry) -> bool {
        let slot = match entry.key {
            key::NODE_CAPABILITIES => &mut self.node_capabilities,
            key::VENDOR_ID => &mut self.vendor_id,
            key::UNIT_SPEC_ID => &mut self.unit_spec_id,
            key::UNIT_SW_VERSION => &mut self.unit_sw_version,
            key::MODEL_ID => &mut self.model_id,
            _ => return false,
        };
        *slot = entry.value;
        true
    }

    /// Append a leaf, surfacing allocation failure instead of aborting
    pub fn push_leaf(&mut self, leaf: TextLeaf) -> Result<(), TryReserveError> {
        if self.leaves.len() == self.leaves.capacity() {
            let grow = self.leaves.capacity().max(1);
            self.leaves.try_reserve_exact(grow)?;
        }
        self.leaves.push(leaf);
        Ok(())
    }

    /// Synthesize the label once the walk is complete
    pub fn finish(&mut self) {
        self.label = if self.leaves.is_empty() {
            None
        } else {
            Some(
                self.leaves
                    .iter()
                    .map(|l| l.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };
    }

    pub fn node_type(&self) -> NodeType {
        classify(self)
    }
}

/// Protocol family a node advertises through its unit directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Unknown,
    /// Digital camera (IIDC)
    Dc,
    /// AV/C device
    Avc,
    /// Storage (SBP-2)
    Sbp2,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Dc => "dc",
            Self::Avc => "avc",
            Self::Sbp2 => "sbp2",
        };
        write!(f, "{}", name)
    }
}

/// Match unit spec id / software version against the known profiles
pub fn classify(dir: &ConfigDirectory) -> NodeType {
    match (dir.unit_spec_id, dir.unit_sw_version) {
        (0xA02D, 0x100) => NodeType::Dc,
        (0xA02D, sw) if sw & 0x01_0000 != 0 => NodeType::Avc,
        (0x609E, 0x10483) => NodeType::Sbp2,
        _ => NodeType::Unknown,
    }
}

/// Decoded bus options quadlet of the bus information block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusOptions {
    /// Isochronous resource manager capable
    pub irmc: bool,
    /// Cycle master capable
    pub cmc: bool,
    /// Isochronous capable
    pub isc: bool,
    /// Bus manager capable
    pub bmc: bool,
    pub cyc_clk_acc: u8,
    /// Maximum asynchronous payload in bytes
    pub max_rec: u32,
}

impl BusOptions {
    pub fn from_quadlet(q: u32) -> Self {
        let max_rec_field = (q >> 12) & 0xF;
        Self {
            irmc: q >> 31 != 0,
            cmc: (q >> 30) & 1 != 0,
            isc: (q >> 29) & 1 != 0,
            bmc: (q >> 28) & 1 != 0,
            cyc_clk_acc: ((q >> 16) & 0xFF) as u8,
            max_rec: 1u32 << (max_rec_field + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_split() {
        let entry = DirectoryEntry::from_quadlet(0x0300_1234);
        assert_eq!(entry.key, key::VENDOR_ID);
        assert_eq!(entry.value, 0x1234);
        assert_eq!(entry.kind(), EntryKind::Immediate);
        assert_eq!(entry.to_quadlet(), 0x0300_1234);
        assert_eq!(DirectoryEntry::from_quadlet(0xD100_0004).kind(), EntryKind::Directory);
        assert_eq!(DirectoryEntry::from_quadlet(0x8100_0002).kind(), EntryKind::TextLeaf);
        assert_eq!(DirectoryEntry::from_quadlet(0x3800_0000).kind(), EntryKind::Unknown);
    }

    #[test]
    fn test_leaf_length_bounds() {
        assert_eq!(leaf_byte_length(0x0004_0000), Some(8));
        assert_eq!(leaf_byte_length(0x0002_0000), None);
        assert_eq!(leaf_byte_length(0x0001_0000), None);
        assert_eq!(leaf_byte_length(0x0042_0000), Some(256));
        assert_eq!(leaf_byte_length(0x0043_0000), None);
    }

    #[test]
    fn test_ascii_leaf_round_trip() {
        for text in ["Acme Co", "Sony", "DCR-TRV900", "x"] {
            let leaf = encode_text_leaf(text);
            let len = leaf_byte_length(leaf[0]).unwrap();
            assert_eq!(decode_leaf_text(CharacterSet::Ascii, &leaf[3..], len), text);
        }
    }

    #[test]
    fn test_wide_leaf_keeps_low_bytes() {
        // "Hi" as little-endian 16-bit units: 'H' 0x00 'i' 0x00
        let payload = [u32::from_be_bytes([b'H', 0, b'i', 0]), 0];
        assert_eq!(decode_leaf_text(CharacterSet::MsUsEnglish, &payload, 8), "Hi");
    }

    #[test]
    fn test_decode_respects_declared_length() {
        let payload = [u32::from_be_bytes(*b"abcd"), u32::from_be_bytes(*b"efgh")];
        assert_eq!(decode_leaf_text(CharacterSet::Ascii, &payload, 4), "abcd");
    }

    #[test]
    fn test_label_absent_without_leaves() {
        let mut dir = ConfigDirectory::new();
        dir.finish();
        assert_eq!(dir.label, None);

        dir.push_leaf(TextLeaf { text: "Acme".into(), charset: CharacterSet::Ascii }).unwrap();
        dir.push_leaf(TextLeaf { text: "Camera".into(), charset: CharacterSet::Ascii }).unwrap();
        dir.finish();
        assert_eq!(dir.label.as_deref(), Some("Acme Camera"));
    }

    #[test]
    fn test_classify() {
        let mut dir = ConfigDirectory::new();
        assert_eq!(classify(&dir), NodeType::Unknown);
        dir.unit_spec_id = 0xA02D;
        dir.unit_sw_version = 0x10001;
        assert_eq!(classify(&dir), NodeType::Avc);
        dir.unit_sw_version = 0x100;
        assert_eq!(classify(&dir), NodeType::Dc);
        dir.unit_spec_id = 0x609E;
        dir.unit_sw_version = 0x10483;
        assert_eq!(classify(&dir), NodeType::Sbp2);
    }

    #[test]
    fn test_bus_options() {
        let opts = BusOptions::from_quadlet(0xE064_A002);
        assert!(opts.irmc && opts.cmc && opts.isc && !opts.bmc);
        assert_eq!(opts.cyc_clk_acc, 0x64);
        assert_eq!(opts.max_rec, 2048);
    }
}

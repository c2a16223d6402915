//! Configuration ROM walking
//!
//! Directories are read one quadlet at a time through the retrier. Every
//! sub-directory must start after the directory that references it, which
//! rules out back references; depth and entry limits bound everything else
//! a malformed ROM could do.

use std::collections::TryReserveError;

use avbus_core::directory::{
    decode_leaf_text, directory_length, leaf_byte_length, rom_offset, EntryKind, BUS_ID_1394,
    LEAF_OVERHEAD_QUADLETS,
};
use avbus_core::{
    BusAddress, BusOptions, CharacterSet, ConfigDirectory, DirectoryEntry, NodeId, TextLeaf,
    CSR_CONFIG_ROM,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bus::Bus;
use crate::retry::{BusError, TransactionRetrier};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed text leaf at {address}: declared {declared} payload bytes")]
    MalformedLeaf { address: BusAddress, declared: i64 },
    #[error("Sub-directory at {child} does not follow its parent at {parent}")]
    CyclicDirectory { parent: BusAddress, child: BusAddress },
    #[error("Out of memory collecting text leaves: {0}")]
    AllocationFailure(#[from] TryReserveError),
    #[error("Directories nested deeper than {0} levels")]
    DepthExceeded(usize),
    #[error("More than {0} directory entries")]
    TooManyEntries(usize),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Sub-directory nesting limit below the root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Total entries visited across all directories
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Fail on a malformed text leaf instead of skipping it
    #[serde(default)]
    pub strict_leaves: bool,
}

fn default_max_depth() -> usize {
    8
}

fn default_max_entries() -> usize {
    1024
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_entries: default_max_entries(),
            strict_leaves: false,
        }
    }
}

/// Decoded bus information block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    /// Length of the bus information block in quadlets
    pub info_length: u8,
    pub bus_id: u32,
    pub options: BusOptions,
    pub guid: u64,
}

struct Walk {
    directory: ConfigDirectory,
    entries: usize,
}

pub struct ConfigDirectoryParser<'a> {
    bus: &'a dyn Bus,
    retrier: &'a TransactionRetrier,
    config: ParserConfig,
}

impl<'a> ConfigDirectoryParser<'a> {
    pub fn new(bus: &'a dyn Bus, retrier: &'a TransactionRetrier, config: ParserConfig) -> Self {
        Self { bus, retrier, config }
    }

    fn quadlet(&self, addr: BusAddress) -> Result<u32, BusError> {
        self.retrier.read_quadlet(self.bus, addr)
    }

    fn rom(node: NodeId, offset: u64) -> BusAddress {
        BusAddress::csr(node, CSR_CONFIG_ROM + offset)
    }

    /// Length of the bus information block in quadlets
    pub fn bus_info_block_length(&self, node: NodeId) -> Result<u8, BusError> {
        let header = self.quadlet(Self::rom(node, rom_offset::HEADER))?;
        let length = (header >> 24) as u8;
        if length != 4 {
            warn!(node = %node, length, "Unexpected bus information block length");
        }
        Ok(length)
    }

    pub fn bus_id(&self, node: NodeId) -> Result<u32, BusError> {
        let bus_id = self.quadlet(Self::rom(node, rom_offset::BUS_ID))?;
        if bus_id != BUS_ID_1394 {
            warn!(node = %node, bus_id = format_args!("{:#010x}", bus_id), "Unexpected bus name");
        }
        Ok(bus_id)
    }

    pub fn bus_options(&self, node: NodeId) -> Result<BusOptions, BusError> {
        Ok(BusOptions::from_quadlet(
            self.quadlet(Self::rom(node, rom_offset::BUS_OPTIONS))?,
        ))
    }

    pub fn bus_info(&self, node: NodeId) -> Result<BusInfo, BusError> {
        Ok(BusInfo {
            info_length: self.bus_info_block_length(node)?,
            bus_id: self.bus_id(node)?,
            options: self.bus_options(node)?,
            guid: self.guid(node)?,
        })
    }

    pub fn guid(&self, node: NodeId) -> Result<u64, BusError> {
        let hi = self.quadlet(Self::rom(node, rom_offset::GUID_HI))?;
        let lo = self.quadlet(Self::rom(node, rom_offset::GUID_LO))?;
        Ok(((hi as u64) << 32) | lo as u64)
    }

    /// Walk the root directory of `node`
    pub fn parse_root(&self, node: NodeId) -> Result<ConfigDirectory, ParseError> {
        self.parse(Self::rom(node, rom_offset::ROOT_DIRECTORY))
    }

    /// Walk the directory at `root` and everything it references
    pub fn parse(&self, root: BusAddress) -> Result<ConfigDirectory, ParseError> {
        let mut walk = Walk {
            directory: ConfigDirectory::new(),
            entries: 0,
        };
        self.walk_directory(root, 0, &mut walk)?;
        walk.directory.finish();
        debug!(
            root = %root,
            entries = walk.entries,
            leaves = walk.directory.leaves.len(),
            "Parsed configuration directory"
        );
        Ok(walk.directory)
    }

    fn walk_directory(&self, dir: BusAddress, depth: usize, walk: &mut Walk) -> Result<(), ParseError> {
        if depth > self.config.max_depth {
            return Err(ParseError::DepthExceeded(self.config.max_depth));
        }
        let count = directory_length(self.quadlet(dir)?);
        trace!(dir = %dir, count, depth, "Directory");

        for i in 1..=count as u64 {
            walk.entries += 1;
            if walk.entries > self.config.max_entries {
                return Err(ParseError::TooManyEntries(self.config.max_entries));
            }
            let entry_addr = dir.add_quadlets(i);
            let entry = DirectoryEntry::from_quadlet(self.quadlet(entry_addr)?);
            match entry.kind() {
                EntryKind::Immediate => {
                    walk.directory.apply_immediate(entry);
                }
                EntryKind::TextLeaf => {
                    self.read_leaf(entry_addr.add_quadlets(entry.value as u64), walk)?;
                }
                EntryKind::Directory => {
                    let child = entry_addr.add_quadlets(entry.value as u64);
                    if child.offset() <= dir.offset() {
                        return Err(ParseError::CyclicDirectory { parent: dir, child });
                    }
                    self.walk_directory(child, depth + 1, walk)?;
                }
                EntryKind::Unknown => {
                    trace!(key = format_args!("{:#04x}", entry.key), "Skipping entry");
                }
            }
        }
        Ok(())
    }

    fn read_leaf(&self, leaf: BusAddress, walk: &mut Walk) -> Result<(), ParseError> {
        let header = self.quadlet(leaf)?;
        let Some(length) = leaf_byte_length(header) else {
            let declared = ((header >> 16) as i64 - LEAF_OVERHEAD_QUADLETS as i64) * 4;
            if self.config.strict_leaves {
                return Err(ParseError::MalformedLeaf { address: leaf, declared });
            }
            warn!(leaf = %leaf, declared, "Skipping text leaf with invalid length");
            return Ok(());
        };

        let language = self.quadlet(leaf.add_quadlets(1))?;
        if language != 0 && language & 0x8000_0000 == 0 {
            warn!(leaf = %leaf, language = format_args!("{:#x}", language), "Unimplemented language for textual leaf");
        }
        let charset = CharacterSet::from_specifier(self.quadlet(leaf.add_quadlets(2))?);

        let bytes = self.retrier.read(self.bus, leaf.add_quadlets(3), length)?;
        let payload: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let text = decode_leaf_text(charset, &payload, length);
        trace!(leaf = %leaf, text = %text, "Text leaf");
        walk.directory.push_leaf(TextLeaf { text, charset })?;
        Ok(())
    }
}

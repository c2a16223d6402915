//! Configuration loading and bus construction

use std::path::Path;

use anyhow::Result;
use avbus_core::directory::key;
use avbus_core::plug::csr;
use avbus_core::CSR_REGISTER_BASE;
use avbus_discovery::ScannerConfig;
use avbus_transport::{
    AvcResponse, FcpConfig, RetryPolicy, RomBuilder, SimAbi, SimAvc, SimBus, SimNode, TransactionRetrier,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub fcp: FcpConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Phy id of our own adapter
    #[serde(default)]
    pub local_phy: u8,
    /// How the stack reports transaction status
    #[serde(default)]
    pub abi: Abi,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            local_phy: 0,
            abi: Abi::Packed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Abi {
    /// Primitives return ack and rcode packed in one word
    #[default]
    Packed,
    /// Primitives fail with an errno, busy shows up as EAGAIN
    Errno,
}

/// One node on the simulated bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub phy: u8,
    #[serde(default)]
    pub guid: u64,
    pub vendor_id: Option<u32>,
    pub vendor: Option<String>,
    pub model_id: Option<u32>,
    pub model: Option<String>,
    pub unit: Option<UnitConfig>,
    /// Raw configuration ROM image; replaces the fields above when present
    pub rom: Option<Vec<u32>>,
    /// Raw plug register contents, in host order
    #[serde(default)]
    pub plugs: PlugRegisters,
    pub avc: Option<AvcConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnitConfig {
    pub spec_id: u32,
    pub sw_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlugRegisters {
    pub output_mpr: Option<u32>,
    #[serde(default)]
    pub output_pcrs: Vec<u32>,
    pub input_mpr: Option<u32>,
    #[serde(default)]
    pub input_pcrs: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvcConfig {
    #[serde(default = "default_reply")]
    pub reply: AvcResponse,
    /// Send an INTERIM frame before the final response
    #[serde(default)]
    pub interim: bool,
    /// Commands to ignore before answering
    #[serde(default)]
    pub unanswered: u32,
}

fn default_reply() -> AvcResponse {
    AvcResponse::Accepted
}

impl NodeConfig {
    fn rom(&self) -> Vec<u32> {
        if let Some(raw) = &self.rom {
            return raw.clone();
        }
        let mut rom = RomBuilder::new(self.guid);
        if let Some(vendor_id) = self.vendor_id {
            rom = rom.immediate(key::VENDOR_ID, vendor_id);
        }
        if let Some(vendor) = &self.vendor {
            rom = rom.text(vendor);
        }
        if let Some(model_id) = self.model_id {
            rom = rom.immediate(key::MODEL_ID, model_id);
        }
        if let Some(model) = &self.model {
            rom = rom.text(model);
        }
        if let Some(unit) = self.unit {
            rom = rom.unit(unit.spec_id, unit.sw_version);
        }
        rom.build()
    }

    fn sim_node(&self) -> SimNode {
        let mut node = SimNode::new().with_rom(&self.rom());
        let plugs = &self.plugs;
        if let Some(mpr) = plugs.output_mpr {
            node = node.with_quadlet(CSR_REGISTER_BASE + csr::OUTPUT_MPR, mpr);
        }
        node = node.with_quadlets(CSR_REGISTER_BASE + csr::OUTPUT_PCR_0, &plugs.output_pcrs);
        if let Some(mpr) = plugs.input_mpr {
            node = node.with_quadlet(CSR_REGISTER_BASE + csr::INPUT_MPR, mpr);
        }
        node = node.with_quadlets(CSR_REGISTER_BASE + csr::INPUT_PCR_0, &plugs.input_pcrs);
        if let Some(avc) = &self.avc {
            let mut sim = SimAvc::replying(avc.reply).unanswered(avc.unanswered);
            if avc.interim {
                sim = sim.with_interim();
            }
            node = node.with_avc(sim);
        }
        node
    }
}

impl Config {
    /// Build the simulated bus described by the `[bus]` and `[[node]]` tables
    pub fn build_bus(&self) -> SimBus {
        let abi = match self.bus.abi {
            Abi::Packed => SimAbi::Packed,
            Abi::Errno => SimAbi::Errno,
        };
        let mut bus = SimBus::new(self.bus.local_phy).with_abi(abi);
        for node in &self.nodes {
            debug!(phy = node.phy, guid = format_args!("{:#018x}", node.guid), "Adding node");
            bus = bus.with_node(node.phy, node.sim_node());
        }
        bus
    }

    /// Retrier matching the configured status convention
    pub fn retrier(&self) -> TransactionRetrier {
        match self.bus.abi {
            Abi::Packed => TransactionRetrier::packed(self.retry.clone()),
            Abi::Errno => TransactionRetrier::errno(self.retry.clone()),
        }
    }
}

/// Load configuration from file, falling back to defaults when it is absent
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), nodes = config.nodes.len(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

//! Bus scanner that reports every node it can reach

use std::sync::Arc;

use avbus_core::{ConfigDirectory, InputMpr, InputPcr, NodeId, NodeType, OutputMpr, OutputPcr};
use avbus_transport::{Bus, BusError, ConfigDirectoryParser, ParserConfig, PlugClient, PlugError, TransactionRetrier};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Limits for configuration ROM walks
    #[serde(default)]
    pub rom: ParserConfig,
    /// Read plug registers of AV/C nodes
    #[serde(default = "default_read_plugs")]
    pub read_plugs: bool,
}

fn default_read_plugs() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rom: ParserConfig::default(),
            read_plugs: default_read_plugs(),
        }
    }
}

/// Master plug register plus the active plug control registers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlugReport<M, P> {
    pub mpr: M,
    pub pcrs: Vec<P>,
}

/// Everything learned about one node; failures are collected, not fatal
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub port: usize,
    /// The node is our own adapter
    pub local: bool,
    pub guid: Option<u64>,
    pub node_type: NodeType,
    pub directory: Option<ConfigDirectory>,
    pub outputs: Option<PlugReport<OutputMpr, OutputPcr>>,
    pub inputs: Option<PlugReport<InputMpr, InputPcr>>,
    pub errors: Vec<String>,
}

impl NodeReport {
    fn new(node: NodeId, port: usize, local: bool) -> Self {
        Self {
            node,
            port,
            local,
            guid: None,
            node_type: NodeType::Unknown,
            directory: None,
            outputs: None,
            inputs: None,
            errors: Vec::new(),
        }
    }

    /// Directory label, or "-" when the node advertises none
    pub fn label(&self) -> &str {
        self.directory
            .as_ref()
            .and_then(|d| d.label.as_deref())
            .unwrap_or("-")
    }
}

/// Ways to pick a device out of the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMatch {
    Guid(u64),
    Unit { spec_id: u32, sw_version: u32 },
}

/// Discovery event for progress reporting
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    ScanStarted { port: usize, nodes: usize },
    NodeFound(Box<NodeReport>),
    ScanCompleted { found: usize, total: usize },
}

pub struct BusScanner {
    bus: Arc<dyn Bus>,
    retrier: TransactionRetrier,
    config: ScannerConfig,
    event_tx: broadcast::Sender<DiscoveryEvent>,
}

impl BusScanner {
    pub fn new(bus: Arc<dyn Bus>, retrier: TransactionRetrier, config: ScannerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            bus,
            retrier,
            config,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    fn parser(&self) -> ConfigDirectoryParser<'_> {
        ConfigDirectoryParser::new(self.bus.as_ref(), &self.retrier, self.config.rom.clone())
    }

    /// Scan every port of the adapter
    pub fn scan_all_ports(&self) -> Result<Vec<NodeReport>, BusError> {
        let ports = self.bus.ports()?;
        let mut reports = Vec::new();
        for (port, info) in ports.iter().enumerate() {
            debug!(port, name = %info.name, nodes = info.nodes, "Selecting port");
            self.bus.set_port(port)?;
            reports.extend(self.scan(port));
        }
        Ok(reports)
    }

    /// Scan the nodes of the currently selected port
    pub fn scan(&self, port: usize) -> Vec<NodeReport> {
        let total = self.bus.node_count();
        let _ = self.event_tx.send(DiscoveryEvent::ScanStarted { port, nodes: total });
        info!(port, nodes = total, "Starting bus scan");

        let mut reports = Vec::with_capacity(total);
        for phy in 0..total {
            let report = self.scan_node(port, NodeId::local(phy as u8));
            let _ = self.event_tx.send(DiscoveryEvent::NodeFound(Box::new(report.clone())));
            reports.push(report);
        }

        let found = reports.iter().filter(|r| r.guid.is_some()).count();
        info!(port, found, total, "Bus scan complete");
        let _ = self.event_tx.send(DiscoveryEvent::ScanCompleted { found, total });
        reports
    }

    pub fn scan_node(&self, port: usize, node: NodeId) -> NodeReport {
        let mut report = NodeReport::new(node, port, node == self.bus.local_id());
        let parser = self.parser();

        match parser.guid(node) {
            Ok(guid) => report.guid = Some(guid),
            Err(e) => {
                warn!(node = %node, error = %e, "Node did not answer");
                report.errors.push(format!("guid: {}", e));
                return report;
            }
        }

        match parser.parse_root(node) {
            Ok(directory) => {
                report.node_type = directory.node_type();
                report.directory = Some(directory);
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Configuration ROM unreadable");
                report.errors.push(format!("rom: {}", e));
            }
        }

        if self.config.read_plugs && report.node_type == NodeType::Avc {
            let plugs = PlugClient::new(self.bus.as_ref(), &self.retrier);
            match read_outputs(&plugs, node) {
                Ok(outputs) => report.outputs = Some(outputs),
                Err(e) => report.errors.push(format!("output plugs: {}", e)),
            }
            match read_inputs(&plugs, node) {
                Ok(inputs) => report.inputs = Some(inputs),
                Err(e) => report.errors.push(format!("input plugs: {}", e)),
            }
        }

        debug!(node = %node, node_type = %report.node_type, label = report.label(), "Node scanned");
        report
    }

    /// First node on the current port matching `criteria`
    pub fn find_device(&self, criteria: DeviceMatch) -> Option<NodeId> {
        let parser = self.parser();
        (0..self.bus.node_count())
            .map(|phy| NodeId::local(phy as u8))
            .find(|&node| match criteria {
                DeviceMatch::Guid(guid) => parser.guid(node).is_ok_and(|g| g == guid),
                DeviceMatch::Unit { spec_id, sw_version } => parser
                    .parse_root(node)
                    .is_ok_and(|d| d.unit_spec_id == spec_id && d.unit_sw_version == sw_version),
            })
    }
}

fn read_outputs(plugs: &PlugClient<'_>, node: NodeId) -> Result<PlugReport<OutputMpr, OutputPcr>, PlugError> {
    let mpr = plugs.output_mpr(node)?;
    let pcrs = (0..mpr.n_plugs as usize)
        .map(|plug| plugs.output_pcr(node, plug))
        .collect::<Result<_, _>>()?;
    Ok(PlugReport { mpr, pcrs })
}

fn read_inputs(plugs: &PlugClient<'_>, node: NodeId) -> Result<PlugReport<InputMpr, InputPcr>, PlugError> {
    let mpr = plugs.input_mpr(node)?;
    let pcrs = (0..mpr.n_plugs as usize)
        .map(|plug| plugs.input_pcr(node, plug))
        .collect::<Result<_, _>>()?;
    Ok(PlugReport { mpr, pcrs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use avbus_core::directory::key;
    use avbus_core::plug::csr;
    use avbus_core::CSR_REGISTER_BASE;
    use avbus_transport::{RetryPolicy, RomBuilder, SimBus, SimNode};

    fn camera() -> SimNode {
        let rom = RomBuilder::new(0x0080_4580_0001_0203)
            .immediate(key::VENDOR_ID, 0x08_0046)
            .text("Sony")
            .unit(0xA02D, 0x1_0001)
            .build();
        SimNode::new()
            .with_rom(&rom)
            .with_quadlet(CSR_REGISTER_BASE + csr::OUTPUT_MPR, 0x803F_0001)
            .with_quadlet(CSR_REGISTER_BASE + csr::OUTPUT_PCR_0, 0x803F_3C7A)
            .with_quadlet(CSR_REGISTER_BASE + csr::INPUT_MPR, 0x8000_0001)
    }

    fn disk() -> SimNode {
        let rom = RomBuilder::new(0x0030_E001_0000_0042).unit(0x609E, 0x10483).build();
        SimNode::new().with_rom(&rom)
    }

    fn scanner() -> BusScanner {
        let adapter = RomBuilder::new(0x0011_0600_0000_0001).build();
        let bus = SimBus::new(0)
            .with_node(0, SimNode::new().with_rom(&adapter))
            .with_node(1, camera())
            .with_node(2, disk())
            .with_node(4, SimNode::new());
        BusScanner::new(
            Arc::new(bus),
            TransactionRetrier::packed(RetryPolicy { max_attempts: 2, delay_ms: 0 }),
            ScannerConfig::default(),
        )
    }

    #[test]
    fn test_scan_reports_every_phy() {
        let scanner = scanner();
        let reports = scanner.scan(0);
        assert_eq!(reports.len(), 5);

        assert!(reports[0].local);
        assert_eq!(reports[0].guid, Some(0x0011_0600_0000_0001));

        let camera = &reports[1];
        assert_eq!(camera.node_type, NodeType::Avc);
        assert_eq!(camera.label(), "Sony");
        let outputs = camera.outputs.as_ref().unwrap();
        assert_eq!(outputs.mpr.n_plugs, 1);
        assert_eq!(outputs.pcrs[0].channel, 63);
        assert_eq!(camera.inputs.as_ref().unwrap().pcrs.len(), 1);
        assert!(camera.errors.is_empty());

        assert_eq!(reports[2].node_type, NodeType::Sbp2);
        assert!(reports[2].outputs.is_none());

        // phy 3 is absent, phy 4 has an empty ROM
        assert_eq!(reports[3].guid, None);
        assert_eq!(reports[3].errors.len(), 1);
        assert_eq!(reports[4].guid, Some(0));
        assert_eq!(reports[4].node_type, NodeType::Unknown);
    }

    #[test]
    fn test_find_device() {
        let scanner = scanner();
        assert_eq!(
            scanner.find_device(DeviceMatch::Guid(0x0030_E001_0000_0042)),
            Some(NodeId::local(2))
        );
        assert_eq!(
            scanner.find_device(DeviceMatch::Unit { spec_id: 0xA02D, sw_version: 0x1_0001 }),
            Some(NodeId::local(1))
        );
        assert_eq!(scanner.find_device(DeviceMatch::Guid(7)), None);
    }

    #[test]
    fn test_scan_events() {
        let scanner = scanner();
        let mut events = scanner.subscribe();
        scanner.scan_all_ports().unwrap();

        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::ScanStarted { port: 0, nodes: 5 })));
        for _ in 0..5 {
            assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::NodeFound(_))));
        }
        assert!(matches!(
            events.try_recv(),
            Ok(DiscoveryEvent::ScanCompleted { found: 4, total: 5 })
        ));
    }

    #[test]
    fn test_report_serializes() {
        let scanner = scanner();
        let report = scanner.scan_node(0, NodeId::local(2));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["node_type"], "sbp2");
        assert_eq!(json["local"], false);
    }
}

//! avbusctl - inspect and drive nodes on an IEEE-1394 bus
//!
//! The bus is described by a TOML file and simulated in-process, so every
//! command runs the same transport code a hardware adapter would.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use avbus_core::{DataRate, InputMpr, InputPcr, NodeId, OutputMpr, OutputPcr, BROADCAST_CHANNEL_NONE};
use avbus_discovery::{BusScanner, DeviceMatch, NodeReport};
use avbus_host::{host_inputs, host_outputs};
use avbus_transport::avc::PANEL_OPERATIONS;
use avbus_transport::{
    AvcClient, Bus, ConfigDirectoryParser, PanelOperation, PlugClient, TransactionRetrier, VcrCommand,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "avbusctl")]
#[command(about = "IEEE-1394 bus inspection and AV/C control")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "avbus.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan every port and list the nodes found
    Report {
        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Dump the bus information block and root directory of a node
    Rom {
        node: u8,
        #[arg(long)]
        json: bool,
    },
    /// Read or write plug control registers on a node
    Plug {
        #[command(subcommand)]
        action: PlugAction,
    },
    /// Send a tape recorder command
    Vcr {
        node: u8,
        /// play, pause, stop, rewind, ff, next, prev, record or eject
        command: String,
    },
    /// Press panel buttons
    Panel {
        #[command(subcommand)]
        action: PanelAction,
    },
    /// Host plug registers on the local node
    Host {
        #[arg(value_enum)]
        direction: Direction,
        /// Number of plugs to expose
        #[arg(long, default_value_t = 1)]
        plugs: u8,
        /// Channel of the prototype PCR
        #[arg(long, default_value_t = 63)]
        channel: u8,
        /// Data rate code (0 = S100, 1 = S200, 2 = S400)
        #[arg(long, default_value_t = 2)]
        rate: u32,
        /// Keep the registers up until interrupted
        #[arg(long)]
        wait: bool,
    },
    /// Locate a node by GUID or unit directory
    Find {
        #[arg(long, value_parser = parse_u64, conflicts_with = "unit")]
        guid: Option<u64>,
        /// Unit spec id and software version, as SPEC:VERSION
        #[arg(long, value_parser = parse_unit)]
        unit: Option<(u32, u32)>,
    },
}

#[derive(Subcommand, Debug)]
enum PlugAction {
    Get {
        node: u8,
        #[arg(value_enum)]
        register: Register,
        /// PCR number
        #[arg(long, default_value_t = 0)]
        plug: usize,
    },
    Set {
        node: u8,
        #[arg(value_enum)]
        register: Register,
        #[arg(value_parser = parse_u32)]
        value: u32,
        #[arg(long, default_value_t = 0)]
        plug: usize,
    },
}

#[derive(Subcommand, Debug)]
enum PanelAction {
    /// Press and release one button
    Press { node: u8, operation: String },
    /// Key in a channel number
    Channel { node: u8, channel: u16 },
    /// List known operations
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Register {
    #[value(name = "ompr")]
    OutputMpr,
    #[value(name = "opcr")]
    OutputPcr,
    #[value(name = "impr")]
    InputMpr,
    #[value(name = "ipcr")]
    InputPcr,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Output,
    Input,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("'{}' does not fit in 32 bits", s))
}

fn parse_unit(s: &str) -> Result<(u32, u32), String> {
    let (spec, version) = s
        .split_once(':')
        .ok_or_else(|| format!("expected SPEC:VERSION, got '{}'", s))?;
    Ok((parse_u32(spec)?, parse_u32(version)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("avbusctl v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;
    let bus: Arc<dyn Bus> = Arc::new(config.build_bus());
    let retrier = config.retrier();

    match args.command {
        Command::Report { json } => {
            let scanner = BusScanner::new(bus, retrier, config.scanner.clone());
            let reports = scanner.scan_all_ports()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_reports(&reports);
            }
        }
        Command::Rom { node, json } => {
            let parser = ConfigDirectoryParser::new(bus.as_ref(), &retrier, config.scanner.rom.clone());
            let node = NodeId::local(node);
            let info = parser.bus_info(node).context("reading bus information block")?;
            let directory = parser.parse_root(node).context("parsing root directory")?;
            if json {
                let dump = serde_json::json!({
                    "bus_info": info,
                    "node_type": directory.node_type(),
                    "directory": directory,
                });
                println!("{}", serde_json::to_string_pretty(&dump)?);
                return Ok(());
            }
            println!("GUID:             {:#018x}", info.guid);
            println!("Bus id:           {:#010x}", info.bus_id);
            println!("Bus info length:  {}", info.info_length);
            println!(
                "Capabilities:     irmc={} cmc={} isc={} bmc={} max_rec={}",
                info.options.irmc, info.options.cmc, info.options.isc, info.options.bmc, info.options.max_rec
            );
            println!("Vendor id:        {:#08x}", directory.vendor_id);
            println!("Model id:         {:#08x}", directory.model_id);
            println!("Node capabilities:{:#08x}", directory.node_capabilities);
            println!(
                "Unit:             spec {:#08x} version {:#08x} ({})",
                directory.unit_spec_id,
                directory.unit_sw_version,
                directory.node_type()
            );
            for leaf in &directory.leaves {
                println!("Text:             {:?} [{:?}]", leaf.text, leaf.charset);
            }
        }
        Command::Plug { action } => run_plug(bus.as_ref(), &retrier, action)?,
        Command::Vcr { node, command } => {
            let command: VcrCommand = command.parse()?;
            let client = AvcClient::new(bus, retrier, config.fcp.clone());
            let response = client.vcr(NodeId::local(node), command).await?;
            println!("{}: {}", command.name(), response);
        }
        Command::Panel { action } => match action {
            PanelAction::List => {
                for op in PANEL_OPERATIONS {
                    println!("{:<18} {:#04x}  {}", op.name, op.id, op.description);
                }
            }
            PanelAction::Press { node, operation } => {
                let Some(op) = PanelOperation::lookup(&operation) else {
                    bail!("Unknown panel operation '{}'", operation);
                };
                let client = AvcClient::new(bus, retrier, config.fcp.clone());
                let response = client.panel(NodeId::local(node), op).await?;
                println!("{}: {}", op.name, response);
            }
            PanelAction::Channel { node, channel } => {
                let client = AvcClient::new(bus, retrier, config.fcp.clone());
                client.tune_channel(NodeId::local(node), channel).await?;
                println!("channel {:03} keyed in", channel % 1000);
            }
        },
        Command::Host {
            direction,
            plugs,
            channel,
            rate,
            wait,
        } => {
            let data_rate = DataRate::from_bits(rate);
            let host = match direction {
                Direction::Output => {
                    let mpr = OutputMpr {
                        n_plugs: plugs,
                        data_rate,
                        ..Default::default()
                    };
                    let pcr = OutputPcr {
                        online: true,
                        channel,
                        data_rate,
                        ..Default::default()
                    };
                    host_outputs(bus.clone(), mpr, pcr)?
                }
                Direction::Input => {
                    let mpr = InputMpr {
                        n_plugs: plugs,
                        data_rate,
                        ..Default::default()
                    };
                    let pcr = InputPcr {
                        online: true,
                        channel,
                        ..Default::default()
                    };
                    host_inputs(bus.clone(), mpr, pcr)?
                }
            };

            // Read the registers back through the bus to show what peers see
            let local = bus.local_id();
            let client = PlugClient::new(bus.as_ref(), &retrier);
            let snapshot = host.snapshot();
            for index in 0..=snapshot.n_plugs() {
                let offset = host.direction().mpr_offset() + 4 * index as u64;
                println!("{:#05x}: {:#010x}", offset, client.get(local, offset)?);
            }

            if wait {
                println!("Hosting {} plugs, press Ctrl-C to stop", host.direction());
                tokio::signal::ctrl_c().await?;
            }
            host.unregister()?;
        }
        Command::Find { guid, unit } => {
            let criteria = match (guid, unit) {
                (Some(guid), _) => DeviceMatch::Guid(guid),
                (None, Some((spec_id, sw_version))) => DeviceMatch::Unit { spec_id, sw_version },
                (None, None) => bail!("Pass --guid or --unit"),
            };
            let scanner = BusScanner::new(bus, retrier, config.scanner.clone());
            match scanner.find_device(criteria) {
                Some(node) => println!("{}", node),
                None => bail!("No matching node"),
            }
        }
    }

    Ok(())
}

fn run_plug(bus: &dyn Bus, retrier: &TransactionRetrier, action: PlugAction) -> Result<()> {
    let plugs = PlugClient::new(bus, retrier);
    match action {
        PlugAction::Get { node, register, plug } => {
            let node = NodeId::local(node);
            match register {
                Register::OutputMpr => println!("{:#?}", plugs.output_mpr(node)?),
                Register::InputMpr => println!("{:#?}", plugs.input_mpr(node)?),
                Register::OutputPcr => println!("{:#?}", plugs.output_pcr(node, plug)?),
                Register::InputPcr => println!("{:#?}", plugs.input_pcr(node, plug)?),
            }
        }
        PlugAction::Set {
            node,
            register,
            value,
            plug,
        } => {
            let node = NodeId::local(node);
            match register {
                Register::OutputMpr => plugs.set_output_mpr(node, OutputMpr::unpack(value))?,
                Register::InputMpr => plugs.set_input_mpr(node, InputMpr::unpack(value))?,
                Register::OutputPcr => plugs.set_output_pcr(node, plug, OutputPcr::unpack(value))?,
                Register::InputPcr => plugs.set_input_pcr(node, plug, InputPcr::unpack(value))?,
            }
            println!("{:#010x} written", value);
        }
    }
    Ok(())
}

fn broadcast_channel(channel: u8) -> String {
    if channel == BROADCAST_CHANNEL_NONE {
        "none".to_string()
    } else {
        channel.to_string()
    }
}

fn print_reports(reports: &[NodeReport]) {
    println!("Discovered {} nodes:", reports.len());
    for report in reports {
        let guid = report
            .guid
            .map(|g| format!("{:#018x}", g))
            .unwrap_or_else(|| "-".to_string());
        let marker = if report.local { " (local)" } else { "" };
        println!(
            "  - port {} {}{}: {} [{}] {}",
            report.port,
            report.node,
            marker,
            guid,
            report.node_type,
            report.label()
        );
        if let Some(outputs) = &report.outputs {
            println!(
                "    Output plugs: {} (broadcast channel {})",
                outputs.pcrs.len(),
                broadcast_channel(outputs.mpr.bcast_channel)
            );
            for (i, pcr) in outputs.pcrs.iter().enumerate() {
                println!(
                    "      oPCR[{}]: online={} channel={} p2p={}",
                    i, pcr.online, pcr.channel, pcr.n_p2p_connections
                );
            }
        }
        if let Some(inputs) = &report.inputs {
            println!("    Input plugs: {}", inputs.pcrs.len());
        }
        for error in &report.errors {
            println!("    Error: {}", error);
        }
    }
}

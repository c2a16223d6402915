//! AV/C commands carried over FCP
//!
//! Frames start with a quadlet packing the command type (or response code),
//! the addressed subunit and the opcode, followed by opcode-specific operands.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use avbus_core::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::fcp::{CommandResponseCorrelator, FcpConfig, FcpError, ResponseCapture};
use crate::retry::TransactionRetrier;

/// Command types
pub mod ctype {
    pub const CONTROL: u8 = 0x0;
    pub const STATUS: u8 = 0x1;
    pub const SPECIFIC_INQUIRY: u8 = 0x2;
    pub const NOTIFY: u8 = 0x3;
    pub const GENERAL_INQUIRY: u8 = 0x4;
}

/// Subunit types
pub mod subunit {
    pub const MONITOR: u8 = 0x00;
    pub const AUDIO: u8 = 0x01;
    pub const DISC: u8 = 0x03;
    pub const TAPE_RECORDER: u8 = 0x04;
    pub const TUNER: u8 = 0x05;
    pub const CAMERA: u8 = 0x07;
    pub const PANEL: u8 = 0x09;
    pub const UNIT: u8 = 0x1F;
}

/// Opcodes used by the tape recorder and panel helpers
pub mod opcode {
    pub const LOAD_MEDIUM: u8 = 0xC1;
    pub const RECORD: u8 = 0xC2;
    pub const PLAY: u8 = 0xC3;
    pub const WIND: u8 = 0xC4;
    pub const PASS_THROUGH: u8 = 0x7C;
}

/// Response codes, found where a command carries its ctype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvcResponse {
    NotImplemented,
    Accepted,
    Rejected,
    InTransition,
    /// Also reported as "stable" for status commands
    Implemented,
    Changed,
    Interim,
    Other(u8),
}

impl AvcResponse {
    pub fn from_code(code: u8) -> Self {
        match code & 0xF {
            0x8 => Self::NotImplemented,
            0x9 => Self::Accepted,
            0xA => Self::Rejected,
            0xB => Self::InTransition,
            0xC => Self::Implemented,
            0xD => Self::Changed,
            0xF => Self::Interim,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::NotImplemented => 0x8,
            Self::Accepted => 0x9,
            Self::Rejected => 0xA,
            Self::InTransition => 0xB,
            Self::Implemented => 0xC,
            Self::Changed => 0xD,
            Self::Interim => 0xF,
            Self::Other(code) => *code & 0xF,
        }
    }

    /// Response code of a frame in wire order
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        frame.first().map(|b| Self::from_code(b & 0x0F))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted | Self::Implemented | Self::Changed | Self::InTransition)
    }
}

impl fmt::Display for AvcResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotImplemented => write!(f, "NOT IMPLEMENTED"),
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::InTransition => write!(f, "IN TRANSITION"),
            Self::Implemented => write!(f, "IMPLEMENTED/STABLE"),
            Self::Changed => write!(f, "CHANGED"),
            Self::Interim => write!(f, "INTERIM"),
            Self::Other(code) => write!(f, "UNKNOWN RESPONSE {:#x}", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum AvcError {
    #[error("No response after {attempts} attempts")]
    NoResponse { attempts: u32 },
    #[error("Empty response frame")]
    EmptyResponse,
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error(transparent)]
    Fcp(#[from] FcpError),
}

/// An AV/C command addressed to one subunit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcCommand {
    pub ctype: u8,
    pub subunit_type: u8,
    pub subunit_id: u8,
    pub opcode: u8,
    pub operands: Vec<u8>,
}

impl AvcCommand {
    pub fn control(subunit_type: u8, opcode: u8, operands: Vec<u8>) -> Self {
        Self {
            ctype: ctype::CONTROL,
            subunit_type,
            subunit_id: 0,
            opcode,
            operands,
        }
    }

    /// Pack into quadlets, zero-padding the operands
    pub fn frame(&self) -> Vec<u32> {
        let mut bytes = vec![
            self.ctype & 0xF,
            ((self.subunit_type & 0x1F) << 3) | (self.subunit_id & 0x7),
            self.opcode,
        ];
        bytes.extend_from_slice(&self.operands);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Tape recorder transport commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcrCommand {
    Play,
    Pause,
    Stop,
    Rewind,
    FastForward,
    NextFrame,
    PreviousFrame,
    Record,
    Eject,
}

impl VcrCommand {
    pub const ALL: [VcrCommand; 9] = [
        Self::Play,
        Self::Pause,
        Self::Stop,
        Self::Rewind,
        Self::FastForward,
        Self::NextFrame,
        Self::PreviousFrame,
        Self::Record,
        Self::Eject,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Rewind => "rewind",
            Self::FastForward => "ff",
            Self::NextFrame => "next",
            Self::PreviousFrame => "prev",
            Self::Record => "record",
            Self::Eject => "eject",
        }
    }

    pub fn command(&self) -> AvcCommand {
        let (op, operand) = match self {
            Self::Play => (opcode::PLAY, 0x75),
            Self::Pause => (opcode::PLAY, 0x7D),
            Self::NextFrame => (opcode::PLAY, 0x30),
            Self::PreviousFrame => (opcode::PLAY, 0x40),
            Self::Stop => (opcode::WIND, 0x60),
            Self::Rewind => (opcode::WIND, 0x65),
            Self::FastForward => (opcode::WIND, 0x75),
            Self::Record => (opcode::RECORD, 0x75),
            Self::Eject => (opcode::LOAD_MEDIUM, 0x60),
        };
        AvcCommand::control(subunit::TAPE_RECORDER, op, vec![operand])
    }
}

impl FromStr for VcrCommand {
    type Err = AvcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AvcError::UnknownCommand(s.to_string()))
    }
}

/// Panel subunit pass-through operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelOperation {
    pub name: &'static str,
    pub id: u8,
    pub description: &'static str,
}

pub const PANEL_OPERATIONS: &[PanelOperation] = &[
    PanelOperation { name: "select", id: 0x00, description: "Select" },
    PanelOperation { name: "up", id: 0x01, description: "Up" },
    PanelOperation { name: "down", id: 0x02, description: "Down" },
    PanelOperation { name: "left", id: 0x03, description: "Left" },
    PanelOperation { name: "right", id: 0x04, description: "Right" },
    PanelOperation { name: "root_menu", id: 0x09, description: "Root menu" },
    PanelOperation { name: "setup_menu", id: 0x0A, description: "Setup menu" },
    PanelOperation { name: "contents_menu", id: 0x0B, description: "Contents menu" },
    PanelOperation { name: "favorite_menu", id: 0x0C, description: "Favorite menu" },
    PanelOperation { name: "exit", id: 0x0D, description: "Exit" },
    PanelOperation { name: "enter", id: 0x2B, description: "Enter" },
    PanelOperation { name: "channel_up", id: 0x30, description: "Channel up" },
    PanelOperation { name: "channel_down", id: 0x31, description: "Channel down" },
    PanelOperation { name: "previous_channel", id: 0x32, description: "Previous channel" },
    PanelOperation { name: "display_info", id: 0x35, description: "Display information" },
    PanelOperation { name: "help", id: 0x36, description: "Help" },
    PanelOperation { name: "page_up", id: 0x37, description: "Page up" },
    PanelOperation { name: "page_down", id: 0x38, description: "Page down" },
    PanelOperation { name: "power", id: 0x40, description: "Power" },
    PanelOperation { name: "volume_up", id: 0x41, description: "Volume up" },
    PanelOperation { name: "volume_down", id: 0x42, description: "Volume down" },
    PanelOperation { name: "mute", id: 0x43, description: "Mute" },
    PanelOperation { name: "play", id: 0x44, description: "Play" },
    PanelOperation { name: "stop", id: 0x45, description: "Stop" },
    PanelOperation { name: "pause", id: 0x46, description: "Pause" },
    PanelOperation { name: "record", id: 0x47, description: "Record" },
    PanelOperation { name: "rewind", id: 0x48, description: "Rewind" },
    PanelOperation { name: "fast_forward", id: 0x49, description: "Fast forward" },
];

/// Operation id of digit `0`; digits 1-9 follow
pub const PANEL_DIGIT_0: u8 = 0x20;

const PANEL_RELEASE: u8 = 0x80;

impl PanelOperation {
    pub fn lookup(name: &str) -> Option<&'static PanelOperation> {
        PANEL_OPERATIONS.iter().find(|op| op.name.eq_ignore_ascii_case(name))
    }

    pub fn press(&self) -> AvcCommand {
        panel_command(self.id)
    }

    pub fn release(&self) -> AvcCommand {
        panel_command(self.id | PANEL_RELEASE)
    }
}

fn panel_command(operation: u8) -> AvcCommand {
    AvcCommand::control(subunit::PANEL, opcode::PASS_THROUGH, vec![operation, 0])
}

/// Press commands that key in a channel number as three digits
pub fn channel_digits(channel: u16) -> Vec<AvcCommand> {
    let channel = channel % 1000;
    [channel / 100, (channel / 10) % 10, channel % 10]
        .into_iter()
        .map(|digit| panel_command(PANEL_DIGIT_0 + digit as u8))
        .collect()
}

/// Issues AV/C commands and waits for their responses
pub struct AvcClient {
    correlator: CommandResponseCorrelator,
    config: FcpConfig,
}

impl AvcClient {
    pub fn new(bus: Arc<dyn Bus>, retrier: TransactionRetrier, config: FcpConfig) -> Self {
        Self {
            correlator: CommandResponseCorrelator::new(bus, retrier),
            config,
        }
    }

    /// Send `command` and return the final response, re-sending after a
    /// timeout up to the configured number of retries
    pub async fn transaction(&self, node: NodeId, command: &AvcCommand) -> Result<ResponseCapture, AvcError> {
        let frame = command.frame();
        let attempts = self.config.retries + 1;
        for attempt in 1..=attempts {
            let handle = self.correlator.send_command(node, &frame)?;
            match handle.wait(self.config.response_timeout()).await {
                Ok(capture) => {
                    debug!(
                        node = %node,
                        opcode = format_args!("{:#04x}", command.opcode),
                        response = ?capture.response(),
                        "AV/C transaction complete"
                    );
                    return Ok(capture);
                }
                Err(FcpError::Timeout) => {
                    warn!(node = %node, attempt, "AV/C command timed out");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AvcError::NoResponse { attempts })
    }

    /// Send `command` and decode only the response code
    pub async fn command(&self, node: NodeId, command: &AvcCommand) -> Result<AvcResponse, AvcError> {
        self.transaction(node, command)
            .await?
            .response()
            .ok_or(AvcError::EmptyResponse)
    }

    pub async fn vcr(&self, node: NodeId, command: VcrCommand) -> Result<AvcResponse, AvcError> {
        let response = self.command(node, &command.command()).await?;
        info!(node = %node, command = command.name(), response = %response, "Tape recorder command");
        Ok(response)
    }

    /// Press and release a panel button
    pub async fn panel(&self, node: NodeId, operation: &PanelOperation) -> Result<AvcResponse, AvcError> {
        let response = self.command(node, &operation.press()).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.command(node, &operation.release()).await?;
        Ok(response)
    }

    /// Key in a channel number on the panel
    pub async fn tune_channel(&self, node: NodeId, channel: u16) -> Result<(), AvcError> {
        for digit in channel_digits(channel) {
            let response = self.command(node, &digit).await?;
            if !response.is_success() {
                warn!(node = %node, response = %response, "Channel digit not accepted");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sim::{SimAvc, SimBus, SimNode};

    fn client(bus: Arc<SimBus>, config: FcpConfig) -> AvcClient {
        AvcClient::new(bus, TransactionRetrier::packed(RetryPolicy::default()), config)
    }

    #[test]
    fn test_vcr_frames() {
        assert_eq!(VcrCommand::Play.command().frame(), vec![0x0020_C375]);
        assert_eq!(VcrCommand::Stop.command().frame(), vec![0x0020_C460]);
        assert_eq!(VcrCommand::Eject.command().frame(), vec![0x0020_C160]);
        assert_eq!("FF".parse::<VcrCommand>().unwrap(), VcrCommand::FastForward);
        assert!("warp".parse::<VcrCommand>().is_err());
    }

    #[test]
    fn test_panel_frames() {
        let power = PanelOperation::lookup("power").unwrap();
        assert_eq!(power.press().frame(), vec![0x0048_7C40, 0]);
        assert_eq!(power.release().frame(), vec![0x0048_7CC0, 0]);

        let digits: Vec<u32> = channel_digits(42).iter().map(|c| c.frame()[0] & 0xFF).collect();
        assert_eq!(digits, vec![0x20, 0x24, 0x22]);
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(AvcResponse::from_frame(&[0x09, 0x20]), Some(AvcResponse::Accepted));
        assert_eq!(AvcResponse::from_frame(&[0xFF]), Some(AvcResponse::Interim));
        assert_eq!(AvcResponse::from_frame(&[]), None);
        assert_eq!(AvcResponse::Implemented.to_string(), "IMPLEMENTED/STABLE");
        assert_eq!(AvcResponse::from_code(AvcResponse::Rejected.code()), AvcResponse::Rejected);
    }

    #[tokio::test]
    async fn test_vcr_transaction() {
        let bus = Arc::new(SimBus::new(0).with_node(
            1,
            SimNode::new().with_avc(SimAvc::replying(AvcResponse::Accepted)),
        ));
        let client = client(bus, FcpConfig::default());
        let response = client.vcr(NodeId::local(1), VcrCommand::Play).await.unwrap();
        assert_eq!(response, AvcResponse::Accepted);
    }

    #[tokio::test]
    async fn test_retries_after_timeout() {
        let bus = Arc::new(SimBus::new(0).with_node(
            1,
            SimNode::new().with_avc(SimAvc::replying(AvcResponse::Accepted).unanswered(2)),
        ));
        let config = FcpConfig {
            response_timeout_ms: 10,
            retries: 2,
            retry_delay_ms: 0,
        };
        let client = client(bus, config);
        let response = client.vcr(NodeId::local(1), VcrCommand::Stop).await.unwrap();
        assert_eq!(response, AvcResponse::Accepted);
    }

    #[tokio::test]
    async fn test_gives_up_without_response() {
        let bus = Arc::new(SimBus::new(0).with_node(1, SimNode::new()));
        let config = FcpConfig {
            response_timeout_ms: 5,
            retries: 1,
            retry_delay_ms: 0,
        };
        let client = client(bus, config);
        let result = client.vcr(NodeId::local(1), VcrCommand::Stop).await;
        assert!(matches!(result, Err(AvcError::NoResponse { attempts: 2 })));
    }
}

//! Outbound command frames (SCADA -> master).
//!
//! ```text
//! v1 (9 bytes):  STX | CMD | MAXV i16 | MINV i16 | CURRENT i8  | CHECKSUM | ETX
//! v2 (10 bytes): STX | CMD | MAXV i16 | MINV i16 | CURRENT u16 | CHECKSUM | ETX
//! ```
//!
//! The command byte carries start/stop in bit 0. v2 adds the operation mode
//! in bits 2..1 (`01` independent, `10` parallel, `00` stop); v1 masters only
//! understand bit 0. Voltages are sent unscaled. Values outside the wire range are clamped, never rejected.

use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};
use crate::protocol::{checksum, clamp_i16, ProtocolVersion, ETX, STX};

const CMD_START_BIT: u8 = 0x01;
const CMD_MODE_INDEPENDENT: u8 = 0b01 << 1;
const CMD_MODE_PARALLEL: u8 = 0b10 << 1;
const CMD_MODE_MASK: u8 = 0b11 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    Start,
    Stop,
}

/// How the master drives its converter modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[default]
    Independent,
    Parallel,
}

/// A command to the master. Build it with [`CommandFrame::start`] or [`CommandFrame::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub mode: CommandMode,
    pub operation_mode: OperationMode,
    /// Upper voltage limit in volts.
    pub max_voltage: f64,
    /// Lower voltage limit in volts.
    pub min_voltage: f64,
    /// Current set-point in amperes.
    pub current: f64,
}

impl CommandFrame {
    pub fn start(
        operation_mode: OperationMode,
        max_voltage: f64,
        min_voltage: f64,
        current: f64,
    ) -> Self {
        Self {
            mode: CommandMode::Start,
            operation_mode,
            max_voltage,
            min_voltage,
            current,
        }
    }

    /// A stop command. All numeric fields are zero regardless of the UI set-points.
    pub fn stop(operation_mode: OperationMode) -> Self {
        Self {
            mode: CommandMode::Stop,
            operation_mode,
            max_voltage: 0.0,
            min_voltage: 0.0,
            current: 0.0,
        }
    }

    pub fn is_start(&self) -> bool {
        self.mode == CommandMode::Start
    }

    /// The same command addressed with a different operation mode.
    pub fn with_operation_mode(mut self, operation_mode: OperationMode) -> Self {
        self.operation_mode = operation_mode;
        self
    }

    fn command_byte(&self, protocol: ProtocolVersion) -> u8 {
        match (self.mode, protocol) {
            (CommandMode::Stop, _) => 0x00,
            (CommandMode::Start, ProtocolVersion::V1) => CMD_START_BIT,
            (CommandMode::Start, ProtocolVersion::V2) => {
                let mode_bits = match self.operation_mode {
                    OperationMode::Independent => CMD_MODE_INDEPENDENT,
                    OperationMode::Parallel => CMD_MODE_PARALLEL,
                };
                CMD_START_BIT | mode_bits
            }
        }
    }
}

/// Encodes [`CommandFrame`]s for one protocol revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandEncoder {
    protocol: ProtocolVersion,
}

impl CommandEncoder {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn frame_len(&self) -> usize {
        self.protocol.command_frame_len()
    }

    /// Build the wire frame for a command.
    pub fn encode(&self, frame: &CommandFrame) -> Vec<u8> {
        let (max_v, min_v, current) = match frame.mode {
            CommandMode::Stop => (0.0, 0.0, 0.0),
            CommandMode::Start => (frame.max_voltage, frame.min_voltage, frame.current),
        };

        let len = self.frame_len();
        let mut out = Vec::with_capacity(len);
        out.push(STX);
        out.push(frame.command_byte(self.protocol));
        out.extend_from_slice(&clamp_i16(max_v).to_be_bytes());
        out.extend_from_slice(&clamp_i16(min_v).to_be_bytes());
        match self.protocol {
            ProtocolVersion::V1 => {
                let raw = current.round().clamp(i8::MIN as f64, i8::MAX as f64) as i8;
                out.push(raw as u8);
            }
            ProtocolVersion::V2 => {
                // Same zero-centred ÷10 encoding the master uses for slave current.
                out.extend_from_slice(&self.protocol.encode_current(current));
            }
        }
        let sum = checksum(&out[1..]);
        out.push(sum);
        out.push(ETX);
        debug_assert_eq!(out.len(), len);
        out
    }

    /// Parse a wire frame back into its semantic fields.
    pub fn decode(&self, bytes: &[u8]) -> Result<CommandFrame> {
        let len = self.frame_len();
        if bytes.len() != len {
            return Err(LinkError::Protocol(format!(
                "command frame must be {len} bytes for {}, got {}",
                self.protocol,
                bytes.len()
            )));
        }
        if bytes[0] != STX || bytes[len - 1] != ETX {
            return Err(LinkError::Protocol(format!(
                "command frame not delimited by STX/ETX: {bytes:02X?}"
            )));
        }
        let calculated = checksum(&bytes[1..len - 2]);
        let received = bytes[len - 2];
        if calculated != received {
            return Err(LinkError::Protocol(format!(
                "command checksum mismatch calc={calculated:02X} recv={received:02X}"
            )));
        }

        let cmd = bytes[1];
        let mode = if cmd & CMD_START_BIT != 0 {
            CommandMode::Start
        } else {
            CommandMode::Stop
        };
        // v1 frames carry no mode bits and decode as independent.
        let operation_mode = match cmd & CMD_MODE_MASK {
            CMD_MODE_PARALLEL => OperationMode::Parallel,
            _ => OperationMode::Independent,
        };
        let max_voltage = i16::from_be_bytes([bytes[2], bytes[3]]) as f64;
        let min_voltage = i16::from_be_bytes([bytes[4], bytes[5]]) as f64;
        let current = match self.protocol {
            ProtocolVersion::V1 => bytes[6] as i8 as f64,
            ProtocolVersion::V2 => self.protocol.decode_current(bytes[6], bytes[7]),
        };

        Ok(CommandFrame {
            mode,
            operation_mode,
            max_voltage,
            min_voltage,
            current,
        })
    }
}

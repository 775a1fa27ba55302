//! Wire vocabulary shared by the decoder, the encoder and the simulator.
//!
//! Every frame on the link is a fixed-size window `STX | payload | checksum | ETX`.
//! The checksum is the 8-bit wrapping sum of the payload bytes.
//!
//! Two firmware revisions are deployed in the field. They agree on the inbound
//! frame layout but differ in how slave current is scaled and in the length of
//! the outbound command frame, so the revision is always an explicit parameter.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::LinkError;

/// Frame start sentinel.
pub const STX: u8 = 0x02;
/// Frame end sentinel.
pub const ETX: u8 = 0x03;

/// Length of every inbound (master -> SCADA) frame.
pub const INBOUND_FRAME_LEN: usize = 7;

/// Hard cap on unconsumed receive bytes before the decoder sheds data.
pub const MAX_BUFFER_LEN: usize = 1024;

/// Highest addressable slave id (5-bit field, 0 is the system voltage).
pub const MAX_SLAVE_ID: u8 = 31;

/// Zero point of the unsigned current encoding used by revision 2.
const CURRENT_CENTER_V2: i32 = 32768;

/// Channel identifier as used by the supervisor.
pub type ChannelId = u8;

/// Protocol revision spoken on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Signed current ÷100 inbound, 9-byte commands with an i8 current.
    #[default]
    V1,
    /// Zero-centred unsigned current ÷10, 10-byte commands with a u16 current.
    V2,
}

impl ProtocolVersion {
    /// Length of an outbound command frame for this revision.
    pub fn command_frame_len(self) -> usize {
        match self {
            ProtocolVersion::V1 => 9,
            ProtocolVersion::V2 => 10,
        }
    }

    /// Decode the two current bytes of a slave reading into amperes.
    pub fn decode_current(self, hi: u8, lo: u8) -> f64 {
        match self {
            ProtocolVersion::V1 => i16::from_be_bytes([hi, lo]) as f64 / 100.0,
            ProtocolVersion::V2 => {
                (u16::from_be_bytes([hi, lo]) as i32 - CURRENT_CENTER_V2) as f64 / 10.0
            }
        }
    }

    /// Encode a slave current (amperes) into its two wire bytes, clamping to range.
    pub fn encode_current(self, current: f64) -> [u8; 2] {
        match self {
            ProtocolVersion::V1 => clamp_i16(current * 100.0).to_be_bytes(),
            ProtocolVersion::V2 => {
                let raw = (current * 10.0).round() + CURRENT_CENTER_V2 as f64;
                (raw.clamp(0.0, u16::MAX as f64) as u16).to_be_bytes()
            }
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "v1"),
            ProtocolVersion::V2 => write!(f, "v2"),
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(ProtocolVersion::V1),
            "v2" | "2" => Ok(ProtocolVersion::V2),
            other => Err(LinkError::InvalidConfig(format!(
                "unknown protocol version '{other}' (expected v1 or v2)"
            ))),
        }
    }
}

/// Additive 8-bit checksum over a payload slice.
#[inline]
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Round and saturate a value into the signed 16-bit wire range.
#[inline]
pub(crate) fn clamp_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

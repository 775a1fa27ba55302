//! Inbound frame decoder.
//!
//! The master streams fixed 7-byte frames:
//!
//! ```text
//! STX | ID | VALUE_HI | VALUE_LO | TEMP | CHECKSUM | ETX
//! ```
//!
//! The ID byte carries the slave id in bits 7..3 and the DAB_OK flag in bit 0.
//! Slave id 0 is the system voltage (signed, ÷10). Any other id is a slave
//! reading whose current scaling depends on the protocol revision and whose
//! temperature is reported in 0.5 °C steps.
//!
//! The decoder owns its receive buffer. Bytes that cannot start a frame are
//! skipped one at a time, which resynchronizes on the next good frame without
//! ever stalling on corrupted input.

use log::{debug, warn};
use serde::Serialize;

use crate::protocol::{
    checksum, now_ms, ChannelId, ProtocolVersion, ETX, INBOUND_FRAME_LEN, MAX_BUFFER_LEN, STX,
};

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedSample {
    SystemVoltage {
        channel: ChannelId,
        voltage: f64,
        timestamp_ms: u64,
    },
    SlaveReading {
        channel: ChannelId,
        slave_id: u8,
        current: f64,
        temperature_c: f64,
        dab_ok: bool,
        timestamp_ms: u64,
    },
}

impl DecodedSample {
    pub fn channel(&self) -> ChannelId {
        match self {
            DecodedSample::SystemVoltage { channel, .. }
            | DecodedSample::SlaveReading { channel, .. } => *channel,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            DecodedSample::SystemVoltage { timestamp_ms, .. }
            | DecodedSample::SlaveReading { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

/// How the checksum of a decoded frame was treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Validation enabled and the embedded checksum matched.
    Valid,
    /// Validation disabled; values kept for diagnostics only.
    Unchecked { calculated: u8, received: u8 },
}

/// Result of examining one candidate frame (or of shedding buffer).
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Decoded {
        sample: DecodedSample,
        checksum: ChecksumStatus,
    },
    /// Frame discarded because the checksum did not match.
    ChecksumMismatch { calculated: u8, received: u8 },
    /// The receive buffer exceeded its cap and its oldest bytes were dropped.
    Overflow { discarded: usize },
}

/// Streaming decoder for one channel.
#[derive(Debug)]
pub struct FrameDecoder {
    channel: ChannelId,
    protocol: ProtocolVersion,
    checksum_enabled: bool,
    max_buffer_len: usize,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(channel: ChannelId, protocol: ProtocolVersion) -> Self {
        Self {
            channel,
            protocol,
            checksum_enabled: true,
            max_buffer_len: MAX_BUFFER_LEN,
            buffer: Vec::with_capacity(MAX_BUFFER_LEN),
        }
    }

    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum_enabled = enabled;
        self
    }

    pub fn with_max_buffer_len(mut self, len: usize) -> Self {
        self.max_buffer_len = len.max(2 * INBOUND_FRAME_LEN);
        self
    }

    pub fn set_checksum_enabled(&mut self, enabled: bool) {
        self.checksum_enabled = enabled;
    }

    pub fn checksum_enabled(&self) -> bool {
        self.checksum_enabled
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Forget any partially received frame (used when a link is reopened).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append freshly read bytes and decode every complete frame.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<FrameOutcome> {
        let mut outcomes = Vec::new();
        self.buffer.extend_from_slice(bytes);
        self.drain_frames(&mut outcomes);
        self.enforce_cap(&mut outcomes);
        outcomes
    }

    /// Bound whatever is left after decoding.
    fn enforce_cap(&mut self, outcomes: &mut Vec<FrameOutcome>) {
        if self.buffer.len() <= self.max_buffer_len {
            return;
        }
        let keep = self.max_buffer_len / 2;
        let discarded = self.buffer.len() - keep;
        self.buffer.drain(..discarded);
        warn!(
            "channel {}: receive buffer over {} bytes, discarded {} oldest bytes",
            self.channel, self.max_buffer_len, discarded
        );
        outcomes.push(FrameOutcome::Overflow { discarded });
    }

    fn drain_frames(&mut self, outcomes: &mut Vec<FrameOutcome>) {
        // Everything before `start` has been consumed or skipped.
        let mut start = 0usize;

        while start < self.buffer.len() {
            let Some(offset) = self.buffer[start..].iter().position(|&b| b == STX) else {
                // No frame can start in the remainder.
                start = self.buffer.len();
                break;
            };
            let i = start + offset;

            if self.buffer.len() - i < INBOUND_FRAME_LEN {
                // Candidate is incomplete; bytes before it can never start a frame.
                start = i;
                break;
            }

            if self.buffer[i + INBOUND_FRAME_LEN - 1] != ETX {
                start = i + 1;
                continue;
            }

            let mut frame = [0u8; INBOUND_FRAME_LEN];
            frame.copy_from_slice(&self.buffer[i..i + INBOUND_FRAME_LEN]);
            outcomes.push(self.decode_frame(&frame));
            start = i + INBOUND_FRAME_LEN;
        }

        self.buffer.drain(..start);
    }

    /// Decode a single framed window. Framing (STX/ETX) is assumed checked.
    pub fn decode_frame(&self, frame: &[u8; INBOUND_FRAME_LEN]) -> FrameOutcome {
        let calculated = checksum(&frame[1..5]);
        let received = frame[5];

        let status = if self.checksum_enabled {
            if calculated != received {
                debug!(
                    "channel {}: checksum error calc={:02X} recv={:02X} frame={:02X?}",
                    self.channel, calculated, received, frame
                );
                return FrameOutcome::ChecksumMismatch {
                    calculated,
                    received,
                };
            }
            ChecksumStatus::Valid
        } else {
            if calculated != received {
                debug!(
                    "channel {}: checksum not verified calc={:02X} recv={:02X}",
                    self.channel, calculated, received
                );
            }
            ChecksumStatus::Unchecked {
                calculated,
                received,
            }
        };

        let id_byte = frame[1];
        let slave_id = (id_byte >> 3) & 0x1F;
        let dab_ok = id_byte & 0x01 != 0;
        let timestamp_ms = now_ms();

        let sample = if slave_id == 0 {
            DecodedSample::SystemVoltage {
                channel: self.channel,
                voltage: i16::from_be_bytes([frame[2], frame[3]]) as f64 / 10.0,
                timestamp_ms,
            }
        } else {
            DecodedSample::SlaveReading {
                channel: self.channel,
                slave_id,
                current: self.protocol.decode_current(frame[2], frame[3]),
                temperature_c: frame[4] as f64 * 0.5,
                dab_ok,
                timestamp_ms,
            }
        };

        FrameOutcome::Decoded {
            sample,
            checksum: status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLAVE_1: [u8; 7] = [0x02, 0x09, 0x00, 0xC8, 0x32, 0xDB, 0x03];

    fn samples(outcomes: &[FrameOutcome]) -> Vec<&DecodedSample> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                FrameOutcome::Decoded { sample, .. } => Some(sample),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_reference_slave_frame() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        let outcomes = decoder.push(&SLAVE_1);

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            FrameOutcome::Decoded {
                sample:
                    DecodedSample::SlaveReading {
                        slave_id,
                        current,
                        temperature_c,
                        dab_ok,
                        ..
                    },
                checksum,
            } => {
                assert_eq!(*slave_id, 1);
                assert!((current - 2.0).abs() < 1e-9);
                assert!((temperature_c - 25.0).abs() < 1e-9);
                assert!(*dab_ok);
                assert_eq!(*checksum, ChecksumStatus::Valid);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn consumes_exactly_one_frame() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        let mut bytes = SLAVE_1.to_vec();
        bytes.extend_from_slice(&[0x02, 0x11, 0x00]);
        let outcomes = decoder.push(&bytes);
        assert_eq!(samples(&outcomes).len(), 1);
        assert_eq!(decoder.buffered(), 3);
    }

    #[test]
    fn system_voltage_is_signed_tenths() {
        // 0xFC18 = -1000 -> -100.0 V
        let payload = [0x00, 0xFC, 0x18, 0x00];
        let frame = [
            STX,
            payload[0],
            payload[1],
            payload[2],
            payload[3],
            checksum(&payload),
            ETX,
        ];
        let mut decoder = FrameDecoder::new(3, ProtocolVersion::V1);
        let outcomes = decoder.push(&frame);
        match samples(&outcomes)[0] {
            DecodedSample::SystemVoltage {
                channel, voltage, ..
            } => {
                assert_eq!(*channel, 3);
                assert!((voltage + 100.0).abs() < 1e-9);
            }
            other => panic!("expected voltage, got {other:?}"),
        }
    }

    #[test]
    fn v2_current_is_zero_centred() {
        let payload = [0x09, 0x7F, 0xEC, 0x32];
        let frame = [
            STX,
            payload[0],
            payload[1],
            payload[2],
            payload[3],
            checksum(&payload),
            ETX,
        ];
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V2);
        let outcomes = decoder.push(&frame);
        match samples(&outcomes)[0] {
            DecodedSample::SlaveReading { current, .. } => assert!((current + 2.0).abs() < 1e-9),
            other => panic!("expected reading, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        assert!(decoder.push(&[]).is_empty());
        decoder.push(&SLAVE_1);
        assert!(decoder.push(&[]).is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn resyncs_after_corrupted_candidate() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        let mut bytes = vec![0x02, 0xFF];
        bytes.extend_from_slice(&SLAVE_1);
        let outcomes = decoder.push(&bytes);
        let found = samples(&outcomes);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            found[0],
            DecodedSample::SlaveReading { slave_id: 1, .. }
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn frame_split_across_reads() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        assert!(decoder.push(&SLAVE_1[..4]).is_empty());
        assert_eq!(decoder.buffered(), 4);
        let outcomes = decoder.push(&SLAVE_1[4..]);
        assert_eq!(samples(&outcomes).len(), 1);
    }

    #[test]
    fn garbage_without_stx_is_discarded() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        assert!(decoder.push(&[0x55, 0xAA, 0x03, 0x10]).is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn checksum_mismatch_is_reported_not_decoded() {
        let mut frame = SLAVE_1;
        frame[5] = 0x00;
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        let outcomes = decoder.push(&frame);
        assert_eq!(
            outcomes,
            vec![FrameOutcome::ChecksumMismatch {
                calculated: 0xDB,
                received: 0x00
            }]
        );
    }

    #[test]
    fn disabled_checksum_still_decodes() {
        let mut frame = SLAVE_1;
        frame[5] = 0x00;
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1).with_checksum(false);
        let outcomes = decoder.push(&frame);
        match &outcomes[0] {
            FrameOutcome::Decoded { checksum, .. } => assert_eq!(
                *checksum,
                ChecksumStatus::Unchecked {
                    calculated: 0xDB,
                    received: 0x00
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn large_push_decodes_every_frame() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        let burst: Vec<u8> = SLAVE_1.iter().copied().cycle().take(200 * SLAVE_1.len()).collect();
        assert!(burst.len() > MAX_BUFFER_LEN);
        let outcomes = decoder.push(&burst);
        assert_eq!(samples(&outcomes).len(), 200);
        assert!(!outcomes
            .iter()
            .any(|o| matches!(o, FrameOutcome::Overflow { .. })));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn flood_without_frames_stays_bounded() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1);
        let mut flood = vec![0x02u8; MAX_BUFFER_LEN + 10];
        flood.extend_from_slice(&SLAVE_1);
        let outcomes = decoder.push(&flood);
        assert_eq!(samples(&outcomes).len(), 1);
        assert_eq!(decoder.buffered(), 0);

        // A trailing partial frame is all that can remain.
        decoder.push(&[0x02; 3]);
        assert_eq!(decoder.buffered(), 3);
    }

    #[test]
    fn oversized_remainder_keeps_trailing_half() {
        let mut decoder = FrameDecoder::new(0, ProtocolVersion::V1).with_max_buffer_len(14);
        decoder.buffer.extend_from_slice(&[0xAA; 20]);
        let mut outcomes = Vec::new();
        decoder.enforce_cap(&mut outcomes);
        assert_eq!(outcomes, vec![FrameOutcome::Overflow { discarded: 13 }]);
        assert_eq!(decoder.buffered(), 7);
    }
}

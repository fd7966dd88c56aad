//! Binary command encoding and inbound frame classification.
//!
//! Every outbound command is a short fixed-prefix byte frame, optionally
//! followed by a computed payload. The encoder is pure and stateless; callers
//! are responsible for sequencing. Numeric truncation and wraparound are
//! defined behavior (unsigned wrapping), not errors.

use crate::types::BatteryReading;
use bytes::{BufMut, Bytes, BytesMut};

/// First byte of every Zone protocol frame
pub const FRAME_PREFIX: u8 = 0x40;

/// Start-workout command frame
///
/// The base opcode is `40 08`; current firmware generations expect the two
/// trailing mode bytes `08 07`.
pub const START_WORKOUT: [u8; 4] = [0x40, 0x08, 0x08, 0x07];

/// Stop-workout command frame
pub const STOP_WORKOUT: [u8; 2] = [0x40, 0x09];

/// Set-device-time opcode; followed by a 4-byte little-endian epoch value
pub const SET_TIME_OPCODE: [u8; 2] = [0x40, 0x04];

/// Battery query command frame
pub const BATTERY_QUERY: [u8; 2] = [0x40, 0x06];

/// LED / post-connect initialization command frame
///
/// Sent exactly once per connection, 1.0 s after the connection is
/// established; the band ignores other commands until it has been received.
pub const LED_INIT: [u8; 7] = [0x40, 0x21, 0x4B, 0x00, 0x00, 0x00, 0x32];

/// Firmware header opcode
pub const FW_HEADER_OPCODE: [u8; 2] = [0x40, 0x12];

/// Trailer byte closing the firmware header frame
pub const FW_HEADER_TRAILER: u8 = 0xAD;

/// Firmware body chunk opcode
pub const FW_CHUNK_OPCODE: [u8; 2] = [0x40, 0x13];

/// Firmware tail opcode
pub const FW_TAIL_OPCODE: [u8; 2] = [0x40, 0x14];

/// Maximum firmware body bytes per chunk frame
pub const FW_CHUNK_SIZE: usize = 128;

/// Length of the firmware image's header region
pub const FW_HEADER_LEN: usize = 5;

/// Length of the firmware image's tail region
pub const FW_TAIL_LEN: usize = 32;

/// Acknowledgement frame confirming the firmware header
pub const HEADER_ACK: [u8; 3] = [0x40, 0x92, 0x00];

/// Acknowledgement frame confirming a firmware body chunk
pub const CHUNK_ACK: [u8; 3] = [0x40, 0x93, 0x00];

/// Acknowledgement frame confirming the firmware tail
pub const TAIL_ACK: [u8; 3] = [0x40, 0x94, 0x00];

/// Acknowledgement marker prefixing the first reply after a workout start
///
/// Protocol metadata, not a telemetry sample: it must be stripped before the
/// remaining bytes are fed to the reassembler.
pub const START_ACK: [u8; 3] = [0x40, 0x88, 0x00];

/// Prefix of a battery reply frame
pub const BATTERY_REPLY_PREFIX: [u8; 2] = [0x40, 0x86];

/// Two-byte marker beginning every telemetry sample
pub const TELEMETRY_MARKER: [u8; 2] = [0x40, 0xE1];

/// Fixed UTC offset, in seconds, the device firmware expects subtracted from
/// epoch time (UTC-7)
pub const DEVICE_UTC_OFFSET_SECS: u64 = 25_200;

/// Encode the set-device-time command for the given Unix epoch seconds
///
/// The device firmware expects a fixed-UTC-offset "local" time: the epoch is
/// reduced by seven hours (saturating at zero rather than underflowing) and
/// truncated to 32 bits little-endian.
#[must_use]
pub fn set_device_time(epoch_secs: u64) -> Bytes {
    let local = epoch_secs.saturating_sub(DEVICE_UTC_OFFSET_SECS);
    #[allow(clippy::cast_possible_truncation)]
    let truncated = local as u32;

    let mut buf = BytesMut::with_capacity(6);
    buf.put_slice(&SET_TIME_OPCODE);
    buf.put_u32_le(truncated);
    buf.freeze()
}

/// Encode the firmware header frame for a source image
///
/// The 4-byte payload is the little-endian 32-bit value read from source
/// bytes 1..5 (the original payload length embedded in the image) plus 5,
/// with defined wraparound, followed by the fixed trailer byte.
///
/// # Panics
///
/// Panics if `source` is shorter than [`FW_HEADER_LEN`] bytes; the firmware
/// transfer machine validates the image size before any frame is encoded.
#[must_use]
pub fn firmware_header(source: &[u8]) -> Bytes {
    let embedded_len = u32::from_le_bytes([source[1], source[2], source[3], source[4]]);
    #[allow(clippy::cast_possible_truncation)]
    let adjusted = embedded_len.wrapping_add(FW_HEADER_LEN as u32);

    let mut buf = BytesMut::with_capacity(7);
    buf.put_slice(&FW_HEADER_OPCODE);
    buf.put_u32_le(adjusted);
    buf.put_u8(FW_HEADER_TRAILER);
    buf.freeze()
}

/// Encode a firmware body chunk frame covering `source[offset..offset + len]`
///
/// # Panics
///
/// Panics if the range exceeds the source; the firmware transfer machine
/// computes in-bounds ranges from its validated cursor.
#[must_use]
pub fn firmware_chunk(source: &[u8], offset: usize, len: usize) -> Bytes {
    debug_assert!(len <= FW_CHUNK_SIZE);

    let mut buf = BytesMut::with_capacity(2 + len);
    buf.put_slice(&FW_CHUNK_OPCODE);
    buf.put_slice(&source[offset..offset + len]);
    buf.freeze()
}

/// Encode the firmware tail frame carrying the final 32 bytes of the image
///
/// # Panics
///
/// Panics if `source` is shorter than [`FW_TAIL_LEN`] bytes; the firmware
/// transfer machine validates the image size before any frame is encoded.
#[must_use]
pub fn firmware_tail(source: &[u8]) -> Bytes {
    let tail = &source[source.len() - FW_TAIL_LEN..];

    let mut buf = BytesMut::with_capacity(2 + FW_TAIL_LEN);
    buf.put_slice(&FW_TAIL_OPCODE);
    buf.put_slice(tail);
    buf.freeze()
}

/// Classified inbound delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    /// Firmware header acknowledgement
    HeaderAck,
    /// Firmware chunk acknowledgement
    ChunkAck,
    /// Firmware tail acknowledgement
    TailAck,
    /// Workout-start acknowledgement; `rest` holds any trailing telemetry
    /// bytes delivered in the same notification
    StartAck {
        /// Bytes following the stripped 3-byte marker
        rest: &'a [u8],
    },
    /// Battery reply
    Battery(BatteryReading),
    /// Anything else: telemetry stream bytes for the reassembler
    Telemetry(&'a [u8]),
}

/// Classify one inbound notification delivery
///
/// Acknowledgements are exact 3-byte frames; the start acknowledgement may
/// arrive with telemetry bytes appended in the same delivery, which are
/// returned for reassembly. Bytes that match no control pattern are telemetry.
#[must_use]
pub fn classify(data: &[u8]) -> InboundFrame<'_> {
    match data {
        _ if data == HEADER_ACK => InboundFrame::HeaderAck,
        _ if data == CHUNK_ACK => InboundFrame::ChunkAck,
        _ if data == TAIL_ACK => InboundFrame::TailAck,
        _ if data.starts_with(&START_ACK) => InboundFrame::StartAck {
            rest: &data[START_ACK.len()..],
        },
        _ if data.starts_with(&BATTERY_REPLY_PREFIX) => parse_battery_reply(data)
            .map_or(InboundFrame::Telemetry(data), InboundFrame::Battery),
        _ => InboundFrame::Telemetry(data),
    }
}

/// Parse a battery reply frame: `40 86 <status>` + 2-byte level, with later
/// firmware generations appending a 2-byte voltage in millivolts
#[must_use]
pub fn parse_battery_reply(data: &[u8]) -> Option<BatteryReading> {
    if !data.starts_with(&BATTERY_REPLY_PREFIX) || data.len() < 5 {
        return None;
    }

    let level = u16::from_le_bytes([data[3], data[4]]);
    let voltage_mv = if data.len() >= 7 {
        Some(u16::from_le_bytes([data[5], data[6]]))
    } else {
        None
    };

    Some(BatteryReading { level, voltage_mv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_time_encoding() {
        let epoch = 1_700_000_000u64;
        let frame = set_device_time(epoch);

        assert_eq!(&frame[..2], &SET_TIME_OPCODE);
        #[allow(clippy::cast_possible_truncation)]
        let expected = (epoch - DEVICE_UTC_OFFSET_SECS) as u32;
        assert_eq!(&frame[2..6], &expected.to_le_bytes());
    }

    #[test]
    fn test_set_time_saturates_at_zero() {
        let frame = set_device_time(100);
        assert_eq!(&frame[2..6], &0u32.to_le_bytes());
    }

    #[test]
    fn test_set_time_truncates() {
        // Epoch far beyond 32 bits wraps rather than erroring.
        let epoch = u64::from(u32::MAX) + DEVICE_UTC_OFFSET_SECS + 10;
        let frame = set_device_time(epoch);
        assert_eq!(&frame[2..6], &9u32.to_le_bytes());
    }

    #[test]
    fn test_firmware_header_math() {
        let mut source = vec![0u8; 64];
        source[1..5].copy_from_slice(&0x0001_0203u32.to_le_bytes());

        let frame = firmware_header(&source);
        assert_eq!(&frame[..2], &FW_HEADER_OPCODE);
        assert_eq!(&frame[2..6], &(0x0001_0203u32 + 5).to_le_bytes());
        assert_eq!(frame[6], FW_HEADER_TRAILER);
    }

    #[test]
    fn test_firmware_header_wraps() {
        let mut source = vec![0u8; 64];
        source[1..5].copy_from_slice(&u32::MAX.to_le_bytes());

        let frame = firmware_header(&source);
        assert_eq!(&frame[2..6], &4u32.to_le_bytes());
    }

    #[test]
    fn test_firmware_chunk_slicing() {
        let source: Vec<u8> = (0..=255u8).collect();
        let frame = firmware_chunk(&source, 10, 128);

        assert_eq!(frame.len(), 130);
        assert_eq!(&frame[..2], &FW_CHUNK_OPCODE);
        assert_eq!(&frame[2..], &source[10..138]);
    }

    #[test]
    fn test_firmware_tail_takes_last_32() {
        let source: Vec<u8> = (0..100u8).collect();
        let frame = firmware_tail(&source);

        assert_eq!(frame.len(), 34);
        assert_eq!(&frame[..2], &FW_TAIL_OPCODE);
        assert_eq!(&frame[2..], &source[68..]);
    }

    #[test]
    fn test_classify_acks() {
        assert_eq!(classify(&HEADER_ACK), InboundFrame::HeaderAck);
        assert_eq!(classify(&CHUNK_ACK), InboundFrame::ChunkAck);
        assert_eq!(classify(&TAIL_ACK), InboundFrame::TailAck);
    }

    #[test]
    fn test_classify_start_ack_strips_marker() {
        let mut delivery = START_ACK.to_vec();
        delivery.extend_from_slice(&[0x40, 0xE1, 0x01]);

        match classify(&delivery) {
            InboundFrame::StartAck { rest } => assert_eq!(rest, &[0x40, 0xE1, 0x01]),
            other => panic!("expected StartAck, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_battery_reply() {
        let reply = [0x40, 0x86, 0x00, 0x64, 0x00];
        match classify(&reply) {
            InboundFrame::Battery(reading) => {
                assert_eq!(reading.level, 100);
                assert_eq!(reading.voltage_mv, None);
            }
            other => panic!("expected Battery, got {other:?}"),
        }

        let with_voltage = [0x40, 0x86, 0x00, 0x64, 0x00, 0xDC, 0x0E];
        let reading = parse_battery_reply(&with_voltage).unwrap();
        assert_eq!(reading.voltage_mv, Some(3804));
    }

    #[test]
    fn test_classify_short_battery_frame_as_telemetry() {
        let truncated = [0x40, 0x86, 0x00];
        assert_eq!(classify(&truncated), InboundFrame::Telemetry(&truncated));
    }

    #[test]
    fn test_classify_telemetry_passthrough() {
        let data = [0x40, 0xE1, 0xAA, 0xBB];
        assert_eq!(classify(&data), InboundFrame::Telemetry(&data));
    }
}

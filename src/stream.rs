//! Telemetry stream reassembly.
//!
//! The band's telemetry framing is non-delimited: a valid sample begins with
//! a fixed 2-byte marker and spans a fixed total length, but the transport
//! delivers bytes in arbitrary chunks that routinely split samples (and even
//! the marker itself) across notifications. The assembler recovers samples by
//! pattern scanning over an accumulating buffer, skipping non-marker bytes
//! one at a time to resynchronize after corruption or a mid-stream connect.

use crate::protocol::TELEMETRY_MARKER;
use crate::types::Sample;
use bytes::{Buf, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Total sample length for first-generation firmware, marker included
pub const SAMPLE_LEN_GEN1: usize = 83;

/// Total sample length for second-generation firmware, marker included
pub const SAMPLE_LEN_GEN2: usize = 100;

/// Reassembles fixed-length telemetry samples from chunked inbound deliveries
///
/// Bytes before the earliest unconsumed marker are never retained past a
/// successful frame extraction; the buffer grows only by inbound deliveries
/// and shrinks only by dropping consumed bytes from the front.
#[derive(Debug)]
pub struct SampleAssembler {
    buffer: BytesMut,
    sample_len: usize,
}

impl SampleAssembler {
    /// Create an assembler for the given total sample length
    ///
    /// The length is firmware-generation dependent ([`SAMPLE_LEN_GEN1`] or
    /// [`SAMPLE_LEN_GEN2`]) and counts the 2-byte marker.
    #[must_use]
    pub fn new(sample_len: usize) -> Self {
        debug_assert!(sample_len > TELEMETRY_MARKER.len());
        Self {
            buffer: BytesMut::new(),
            sample_len,
        }
    }

    /// Configured total sample length
    #[must_use]
    pub const fn sample_len(&self) -> usize {
        self.sample_len
    }

    /// Bytes currently buffered awaiting a complete frame
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append one inbound delivery and extract every completed sample
    ///
    /// Each extracted sample is tagged with the wall-clock capture time at
    /// extraction, not a timestamp embedded in the payload. A marker with
    /// fewer than `sample_len` bytes behind it is retained for the next
    /// delivery; bytes that are part of no marker-aligned window are skipped
    /// one at a time.
    pub fn push(&mut self, data: &[u8]) -> Vec<Sample> {
        self.buffer.extend_from_slice(data);

        let timestamp = epoch_secs();
        let mut samples = Vec::new();
        let mut pos = 0;

        while pos + TELEMETRY_MARKER.len() <= self.buffer.len() {
            if self.buffer[pos..pos + TELEMETRY_MARKER.len()] == TELEMETRY_MARKER {
                if self.buffer.len() - pos >= self.sample_len {
                    samples.push(Sample {
                        timestamp,
                        payload: self.buffer[pos..pos + self.sample_len].to_vec(),
                    });
                    pos += self.sample_len;
                } else {
                    // Partial frame: keep everything from the marker onward.
                    break;
                }
            } else {
                pos += 1;
            }
        }

        // A single trailing byte may be the first half of a split marker.
        if pos + 1 == self.buffer.len() && self.buffer[pos] != TELEMETRY_MARKER[0] {
            pos += 1;
        }

        self.buffer.advance(pos);
        samples
    }

    /// Discard all buffered bytes
    ///
    /// Used when a session ends; a new connection starts mid-stream and
    /// resynchronizes on the next marker.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(fill: u8, len: usize) -> Vec<u8> {
        let mut bytes = TELEMETRY_MARKER.to_vec();
        bytes.resize(len, fill);
        bytes
    }

    #[test]
    fn test_single_delivery_extracts_all() {
        let mut assembler = SampleAssembler::new(SAMPLE_LEN_GEN1);

        let mut stream = Vec::new();
        for fill in [0x11, 0x22, 0x33] {
            stream.extend_from_slice(&sample_bytes(fill, SAMPLE_LEN_GEN1));
        }

        let samples = assembler.push(&stream);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].payload, sample_bytes(0x11, SAMPLE_LEN_GEN1));
        assert_eq!(samples[2].payload, sample_bytes(0x33, SAMPLE_LEN_GEN1));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_arbitrary_chunk_boundaries_match_single_feed() {
        let mut stream = Vec::new();
        for fill in [0xA1, 0xA2, 0xA3, 0xA4] {
            stream.extend_from_slice(&sample_bytes(fill, SAMPLE_LEN_GEN1));
        }

        let mut whole = SampleAssembler::new(SAMPLE_LEN_GEN1);
        let expected: Vec<Vec<u8>> = whole
            .push(&stream)
            .into_iter()
            .map(|s| s.payload)
            .collect();
        assert_eq!(expected.len(), 4);

        // Split at every possible boundary, including mid-marker.
        for split in 1..stream.len() {
            let mut chunked = SampleAssembler::new(SAMPLE_LEN_GEN1);
            let mut collected = Vec::new();
            collected.extend(chunked.push(&stream[..split]));
            collected.extend(chunked.push(&stream[split..]));

            let payloads: Vec<Vec<u8>> = collected.into_iter().map(|s| s.payload).collect();
            assert_eq!(payloads, expected, "split at {split} diverged");
        }
    }

    #[test]
    fn test_one_byte_deliveries() {
        let stream = sample_bytes(0x55, SAMPLE_LEN_GEN2);
        let mut assembler = SampleAssembler::new(SAMPLE_LEN_GEN2);

        let mut collected = Vec::new();
        for byte in &stream {
            collected.extend(assembler.push(std::slice::from_ref(byte)));
        }

        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].payload, stream);
    }

    #[test]
    fn test_resync_skips_garbage() {
        let mut stream = vec![0x00, 0x13, 0x37, 0x40];
        stream.extend_from_slice(&sample_bytes(0x77, SAMPLE_LEN_GEN1));

        let mut assembler = SampleAssembler::new(SAMPLE_LEN_GEN1);
        let samples = assembler.push(&stream);

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].payload, sample_bytes(0x77, SAMPLE_LEN_GEN1));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_partial_frame_retained() {
        let stream = sample_bytes(0x99, SAMPLE_LEN_GEN1);
        let mut assembler = SampleAssembler::new(SAMPLE_LEN_GEN1);

        let samples = assembler.push(&stream[..40]);
        assert!(samples.is_empty());
        assert_eq!(assembler.pending_len(), 40);

        let samples = assembler.push(&stream[40..]);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].payload, stream);
    }

    #[test]
    fn test_trailing_prefix_byte_retained() {
        // A lone 0x40 at the end of a delivery may start the next marker.
        let mut assembler = SampleAssembler::new(SAMPLE_LEN_GEN1);
        assert!(assembler.push(&[0x01, 0x02, 0x40]).is_empty());
        assert_eq!(assembler.pending_len(), 1);

        let mut rest = vec![0xE1];
        rest.extend_from_slice(&sample_bytes(0x42, SAMPLE_LEN_GEN1)[2..]);
        let samples = assembler.push(&rest);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].payload, sample_bytes(0x42, SAMPLE_LEN_GEN1));
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut assembler = SampleAssembler::new(SAMPLE_LEN_GEN1);
        assembler.push(&sample_bytes(0x10, SAMPLE_LEN_GEN1)[..20]);
        assert!(assembler.pending_len() > 0);

        assembler.reset();
        assert_eq!(assembler.pending_len(), 0);
    }
}

//! Firmware transfer state machine.
//!
//! Firmware uploads are a three-stage, strictly acknowledgement-driven
//! protocol: a header frame describing the image, the body streamed in
//! chunks of at most 128 bytes, and a tail frame carrying the image's final
//! 32 bytes. The device acknowledges every frame before the next may be
//! sent; the protocol never pipelines unacknowledged packets, which is the
//! transfer's flow-control mechanism.
//!
//! The machine here is pure: it consumes acknowledgements and yields the next
//! frame to write, leaving the actual transport write to the session manager.
//! A write failure or cancellation clears the transfer context entirely;
//! there is no partial resume.

use crate::{
    error::{Result, ZoneError},
    protocol::{
        firmware_chunk, firmware_header, firmware_tail, FW_CHUNK_SIZE, FW_HEADER_LEN, FW_TAIL_LEN,
    },
    types::TransferProgress,
};
use bytes::Bytes;
use std::path::Path;
use tracing::debug;

/// Minimum acceptable firmware image length: the 5-byte header region plus
/// the 32-byte tail region
pub const MIN_IMAGE_LEN: usize = FW_HEADER_LEN + FW_TAIL_LEN;

/// Stage of an active firmware transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Context created, header not yet sent
    Idle,
    /// Header frame sent, awaiting the header acknowledgement
    HeaderSent,
    /// Body chunks in flight, awaiting chunk acknowledgements
    ChunkInFlight,
    /// Tail frame sent, awaiting the tail acknowledgement
    TailSent,
    /// Transfer completed successfully
    Completed,
    /// Transfer failed (write error); context must be cleared
    Failed,
    /// Transfer cancelled by the caller; context must be cleared
    Cancelled,
}

impl TransferStage {
    /// Whether the transfer can make no further progress
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Acknowledgement kinds the transfer machine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAck {
    /// Header acknowledgement (`40 92 00`)
    Header,
    /// Chunk acknowledgement (`40 93 00`)
    Chunk,
    /// Tail acknowledgement (`40 94 00`)
    Tail,
}

/// Next action produced by the transfer machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStep {
    /// Write this frame to the device and report the given progress
    Send {
        /// Encoded frame bytes
        frame: Bytes,
        /// Progress after this frame is handed to the transport
        progress: TransferProgress,
    },
    /// The transfer finished; report 100% progress then completion
    Completed {
        /// Final progress (all bytes sent)
        progress: TransferProgress,
    },
}

/// Ack-driven three-stage firmware upload
///
/// Holds the immutable source image, a cursor into the body region, and the
/// precomputed tail boundary (`total length - 32`). The invariant
/// `0 <= offset <= tail boundary <= total length` holds throughout.
#[derive(Debug)]
pub struct FirmwareTransfer {
    source: Bytes,
    offset: usize,
    in_flight: usize,
    tail_boundary: usize,
    stage: TransferStage,
}

impl FirmwareTransfer {
    /// Create a transfer context for a firmware image
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::FirmwareTooSmall`] if the image cannot contain
    /// both the header and tail regions. This check runs before any transport
    /// call is made.
    pub fn new(source: impl Into<Bytes>) -> Result<Self> {
        let source = source.into();
        if source.len() < MIN_IMAGE_LEN {
            return Err(ZoneError::FirmwareTooSmall {
                len: source.len(),
                min: MIN_IMAGE_LEN,
            });
        }

        let tail_boundary = source.len() - FW_TAIL_LEN;
        Ok(Self {
            source,
            offset: 0,
            in_flight: 0,
            tail_boundary,
            stage: TransferStage::Idle,
        })
    }

    /// Current transfer stage
    #[must_use]
    pub const fn stage(&self) -> TransferStage {
        self.stage
    }

    /// Current progress
    #[must_use]
    pub fn progress(&self) -> TransferProgress {
        let bytes_sent = match self.stage {
            TransferStage::Idle | TransferStage::HeaderSent => 0,
            TransferStage::Completed => self.source.len(),
            _ => {
                let sent = self.offset + self.in_flight;
                if sent > self.tail_boundary {
                    self.tail_boundary
                } else {
                    sent
                }
            }
        };
        TransferProgress {
            bytes_sent,
            total_bytes: self.source.len(),
        }
    }

    /// Produce the header frame and enter the header stage
    ///
    /// Returns `None` if the transfer has already started; calling out of
    /// sequence is a caller bug that degrades to a no-op.
    pub fn begin(&mut self) -> Option<Bytes> {
        if self.stage != TransferStage::Idle {
            return None;
        }
        self.stage = TransferStage::HeaderSent;
        debug!(total = self.source.len(), "firmware transfer started");
        Some(firmware_header(&self.source))
    }

    /// Feed one acknowledgement and get the next action
    ///
    /// Only the acknowledgement matching the current stage advances the
    /// machine; anything else is ignored (it may belong to other inbound
    /// handling, e.g. battery replies). Returns `None` when no action is
    /// required.
    pub fn handle_ack(&mut self, ack: TransferAck) -> Option<TransferStep> {
        match (self.stage, ack) {
            (TransferStage::HeaderSent, TransferAck::Header) => {
                self.stage = TransferStage::ChunkInFlight;
                Some(self.next_body_step())
            }
            (TransferStage::ChunkInFlight, TransferAck::Chunk) => {
                self.offset += self.in_flight;
                self.in_flight = 0;
                Some(self.next_body_step())
            }
            (TransferStage::TailSent, TransferAck::Tail) => {
                self.stage = TransferStage::Completed;
                debug!("firmware transfer completed");
                Some(TransferStep::Completed {
                    progress: self.progress(),
                })
            }
            _ => None,
        }
    }

    /// Mark the transfer failed after a write error
    pub fn fail(&mut self) {
        self.stage = TransferStage::Failed;
    }

    /// Cancel the transfer
    ///
    /// No "undo" is sent to the device; the caller simply stops scheduling
    /// further steps and drops the context.
    pub fn cancel(&mut self) {
        self.stage = TransferStage::Cancelled;
    }

    fn next_body_step(&mut self) -> TransferStep {
        let remaining = self.tail_boundary - self.offset;
        if remaining == 0 {
            self.stage = TransferStage::TailSent;
            return TransferStep::Send {
                frame: firmware_tail(&self.source),
                progress: self.progress(),
            };
        }

        self.in_flight = remaining.min(FW_CHUNK_SIZE);
        TransferStep::Send {
            frame: firmware_chunk(&self.source, self.offset, self.in_flight),
            progress: self.progress(),
        }
    }
}

/// Parse a hex-text firmware file into image bytes
///
/// Accepts whitespace (spaces, newlines) between byte pairs. Fails fast on
/// odd-length or non-hex content, before any transport call is made.
///
/// # Errors
///
/// Returns [`ZoneError::MalformedFirmwareFile`] on invalid input.
pub fn parse_hex_text(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err(ZoneError::MalformedFirmwareFile(format!(
            "odd hex digit count: {}",
            cleaned.len()
        )));
    }

    let bytes = cleaned.as_bytes();
    let mut image = Vec::with_capacity(cleaned.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let digits = std::str::from_utf8(pair)
            .map_err(|_| ZoneError::MalformedFirmwareFile("non-ASCII content".to_string()))?;
        let value = u8::from_str_radix(digits, 16).map_err(|_| {
            ZoneError::MalformedFirmwareFile(format!("invalid hex byte: {digits:?}"))
        })?;
        image.push(value);
    }
    Ok(image)
}

/// Load and parse a hex-text firmware file
///
/// # Errors
///
/// Returns [`ZoneError::Io`] if the file cannot be read, or
/// [`ZoneError::MalformedFirmwareFile`] if its content is not valid hex text.
pub fn load_hex_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    parse_hex_text(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
    }

    fn drive_to_completion(transfer: &mut FirmwareTransfer) -> (Vec<Bytes>, Vec<usize>) {
        let mut frames = vec![transfer.begin().unwrap()];
        let mut progress = vec![transfer.progress().bytes_sent];

        let mut ack = TransferAck::Header;
        loop {
            match transfer.handle_ack(ack) {
                Some(TransferStep::Send { frame, progress: p }) => {
                    ack = if frame[1] == 0x14 {
                        TransferAck::Tail
                    } else {
                        TransferAck::Chunk
                    };
                    frames.push(frame);
                    progress.push(p.bytes_sent);
                }
                Some(TransferStep::Completed { progress: p }) => {
                    progress.push(p.bytes_sent);
                    break;
                }
                None => panic!("machine stalled in {:?}", transfer.stage()),
            }
        }
        (frames, progress)
    }

    #[test]
    fn test_rejects_undersized_image() {
        let err = FirmwareTransfer::new(image(MIN_IMAGE_LEN - 1)).unwrap_err();
        assert!(matches!(
            err,
            ZoneError::FirmwareTooSmall { len: 36, min: 37 }
        ));
    }

    #[test]
    fn test_chunk_staging_tiles_body_exactly() {
        let source = image(300);
        let mut transfer = FirmwareTransfer::new(source.clone()).unwrap();
        let (frames, _) = drive_to_completion(&mut transfer);

        // frames[0] is the header, the last is the tail, the rest are chunks.
        let chunks = &frames[1..frames.len() - 1];
        let mut body = Vec::new();
        for chunk in chunks {
            assert_eq!(&chunk[..2], &[0x40, 0x13]);
            assert!(chunk.len() - 2 <= FW_CHUNK_SIZE);
            body.extend_from_slice(&chunk[2..]);
        }
        assert_eq!(body, &source[..300 - FW_TAIL_LEN]);

        let tail = frames.last().unwrap();
        assert_eq!(&tail[..2], &[0x40, 0x14]);
        assert_eq!(&tail[2..], &source[300 - FW_TAIL_LEN..]);
        assert_eq!(transfer.stage(), TransferStage::Completed);
    }

    #[test]
    fn test_exact_chunk_multiple_body() {
        // Body of exactly 2 * 128 bytes: no short final chunk.
        let source = image(2 * FW_CHUNK_SIZE + FW_TAIL_LEN);
        let mut transfer = FirmwareTransfer::new(source).unwrap();
        let (frames, _) = drive_to_completion(&mut transfer);

        let chunks = &frames[1..frames.len() - 1];
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 2 + FW_CHUNK_SIZE));
    }

    #[test]
    fn test_progress_monotone_and_clamped() {
        let source_len = 450;
        let mut transfer = FirmwareTransfer::new(image(source_len)).unwrap();
        let (_, progress) = drive_to_completion(&mut transfer);

        for pair in progress.windows(2) {
            assert!(pair[0] <= pair[1], "progress regressed: {progress:?}");
        }
        // During the chunk stage progress never exceeds the tail boundary.
        for &sent in &progress[..progress.len() - 1] {
            assert!(sent <= source_len - FW_TAIL_LEN);
        }
        assert_eq!(*progress.last().unwrap(), source_len);
    }

    #[test]
    fn test_mismatched_ack_ignored() {
        let mut transfer = FirmwareTransfer::new(image(100)).unwrap();
        let _ = transfer.begin().unwrap();

        assert!(transfer.handle_ack(TransferAck::Chunk).is_none());
        assert!(transfer.handle_ack(TransferAck::Tail).is_none());
        assert_eq!(transfer.stage(), TransferStage::HeaderSent);
    }

    #[test]
    fn test_begin_twice_is_noop() {
        let mut transfer = FirmwareTransfer::new(image(100)).unwrap();
        assert!(transfer.begin().is_some());
        assert!(transfer.begin().is_none());
    }

    #[test]
    fn test_cancel_is_terminal() {
        let mut transfer = FirmwareTransfer::new(image(100)).unwrap();
        let _ = transfer.begin();
        transfer.cancel();

        assert!(transfer.stage().is_terminal());
        assert!(transfer.handle_ack(TransferAck::Header).is_none());
    }

    #[test]
    fn test_parse_hex_text() {
        let image = parse_hex_text("40 12 AB\ncd0f").unwrap();
        assert_eq!(image, vec![0x40, 0x12, 0xAB, 0xCD, 0x0F]);

        assert!(matches!(
            parse_hex_text("40 1"),
            Err(ZoneError::MalformedFirmwareFile(_))
        ));
        assert!(matches!(
            parse_hex_text("40 ZZ"),
            Err(ZoneError::MalformedFirmwareFile(_))
        ));
    }
}

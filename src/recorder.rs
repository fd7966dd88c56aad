//! Workout session recording and export.
//!
//! A recording is active between a workout-start acknowledgement and the stop
//! command (or a terminal disconnect). Every reassembled sample is appended
//! and flushed immediately, so an interrupted recording loses at most the
//! in-flight sample. The export format is one line per sample:
//! `<unix-timestamp>,<space-separated-uppercase-hex-bytes>`.

use crate::{
    error::{Result, ZoneError},
    types::Sample,
};
use std::{
    fmt::Write as _,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{info, warn};

/// Incrementally-written recording sink for one workout session
#[derive(Debug)]
pub struct SessionRecorder {
    path: PathBuf,
    file: File,
    sample_count: usize,
}

impl SessionRecorder {
    /// Open a new recording file in the given directory
    ///
    /// The file is named `workout_<unix-seconds>.txt`. The directory is
    /// created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Io`] if the directory or file cannot be created.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let path = dir.join(format!("workout_{epoch}.txt"));
        let file = File::create(&path)?;

        info!(path = %path.display(), "recording started");
        Ok(Self {
            path,
            file,
            sample_count: 0,
        })
    }

    /// Append one sample and flush it to disk
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Io`] if the write or flush fails.
    pub fn append(&mut self, sample: &Sample) -> Result<()> {
        let line = format_line(sample);
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.sample_count += 1;
        Ok(())
    }

    /// Number of samples written so far
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Path of the recording file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize the recording and hand the file to the caller for export
    ///
    /// An empty recording is discarded rather than exported.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::NoRecordedData`] if no samples were captured (the
    /// file is deleted), or [`ZoneError::Io`] if the final flush fails.
    pub fn finalize(mut self) -> Result<PathBuf> {
        self.file.flush()?;
        if self.sample_count == 0 {
            warn!("recording finished with no samples, discarding");
            fs::remove_file(&self.path)?;
            return Err(ZoneError::NoRecordedData);
        }

        info!(
            samples = self.sample_count,
            path = %self.path.display(),
            "recording finalized"
        );
        Ok(self.path)
    }

    /// Delete the recording instead of finalizing it
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Io`] if the file cannot be removed.
    pub fn discard(self) -> Result<()> {
        info!(path = %self.path.display(), "recording discarded");
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Serialize one sample to its export line, trailing newline included
#[must_use]
pub fn format_line(sample: &Sample) -> String {
    let mut line = String::with_capacity(16 + sample.payload.len() * 3);
    let _ = write!(line, "{}", sample.timestamp);
    line.push(',');
    for (i, byte) in sample.payload.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        let _ = write!(line, "{byte:02X}");
    }
    line.push('\n');
    line
}

/// Parse one export line back into a sample
///
/// # Errors
///
/// Returns [`ZoneError::ParseError`] if the line is not
/// `<timestamp>,<hex bytes>`.
pub fn parse_line(line: &str) -> Result<Sample> {
    let line = line.trim_end_matches('\n');
    let (ts, hex) = line
        .split_once(',')
        .ok_or_else(|| ZoneError::ParseError(format!("missing comma: {line:?}")))?;

    let timestamp = ts
        .parse::<u64>()
        .map_err(|_| ZoneError::ParseError(format!("invalid timestamp: {ts:?}")))?;

    let mut payload = Vec::new();
    for token in hex.split_whitespace() {
        let byte = u8::from_str_radix(token, 16)
            .map_err(|_| ZoneError::ParseError(format!("invalid hex byte: {token:?}")))?;
        payload.push(byte);
    }

    Ok(Sample { timestamp, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_line() {
        let sample = Sample {
            timestamp: 1000,
            payload: vec![0x40, 0xE1, 0x0A, 0xFF],
        };
        assert_eq!(format_line(&sample), "1000,40 E1 0A FF\n");
    }

    #[test]
    fn test_line_round_trip() {
        let samples = [
            Sample {
                timestamp: 1000,
                payload: vec![0x40, 0xE1, 0x00, 0x7F],
            },
            Sample {
                timestamp: 1001,
                payload: vec![0x40, 0xE1, 0xAB],
            },
        ];

        for sample in &samples {
            let parsed = parse_line(&format_line(sample)).unwrap();
            assert_eq!(&parsed, sample);
        }
    }

    #[test]
    fn test_parse_line_rejects_malformed() {
        assert!(parse_line("no-comma-here").is_err());
        assert!(parse_line("abc,40 E1").is_err());
        assert!(parse_line("1000,40 GG").is_err());
    }

    #[test]
    fn test_append_and_finalize() {
        let dir = tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path()).unwrap();

        recorder
            .append(&Sample {
                timestamp: 1000,
                payload: vec![0x40, 0xE1, 0x01],
            })
            .unwrap();
        recorder
            .append(&Sample {
                timestamp: 1001,
                payload: vec![0x40, 0xE1, 0x02],
            })
            .unwrap();
        assert_eq!(recorder.sample_count(), 2);

        let path = recorder.finalize().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1000,40 E1 01\n1001,40 E1 02\n");
    }

    #[test]
    fn test_empty_recording_is_discarded() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::create(dir.path()).unwrap();
        let path = recorder.path().to_path_buf();

        let err = recorder.finalize().unwrap_err();
        assert!(matches!(err, ZoneError::NoRecordedData));
        assert!(!path.exists());
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path()).unwrap();
        recorder
            .append(&Sample {
                timestamp: 1,
                payload: vec![0x40, 0xE1],
            })
            .unwrap();

        let path = recorder.path().to_path_buf();
        recorder.discard().unwrap();
        assert!(!path.exists());
    }
}

//! Taps the raw inbound datagram stream.
//!
//! A session hands every datagram it receives to its [`DatagramRecorder`],
//! tagged with the phase of the connection. [`FileRecorder`] writes them in
//! the block format demo players read: a little-endian `i32` length followed
//! by the datagram body without its sequence header.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::network::frame::HEADER_SIZE;

/// Phase of the connection a recorded datagram arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordPhase {
    /// Before the first entity snapshot: level data, config strings, baselines.
    PreGameHeader,
    /// Regular frames while in the game.
    InGame,
}

/// Receives every sequenced datagram a session reads.
///
/// Called on the receive thread before the datagram is decoded.
pub trait DatagramRecorder: Send + Sync {
    /// Records one datagram, sequence header included.
    fn record(&self, phase: RecordPhase, datagram: &[u8]);

    /// Flushes buffered output. Called when the session disconnects.
    fn flush(&self) {}
}

impl<T: DatagramRecorder + ?Sized> DatagramRecorder for std::sync::Arc<T> {
    fn record(&self, phase: RecordPhase, datagram: &[u8]) {
        (**self).record(phase, datagram);
    }

    fn flush(&self) {
        (**self).flush();
    }
}

/// Writes length-prefixed datagram bodies to a file.
#[derive(Debug)]
pub struct FileRecorder {
    out: Mutex<BufWriter<File>>,
}

impl FileRecorder {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_block(&self, body: &[u8]) -> io::Result<()> {
        let len = i32::try_from(body.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;
        let mut out = self.out.lock();
        out.write_all(&len.to_le_bytes())?;
        out.write_all(body)
    }
}

impl DatagramRecorder for FileRecorder {
    fn record(&self, phase: RecordPhase, datagram: &[u8]) {
        let Some(body) = datagram.get(HEADER_SIZE..) else {
            return;
        };
        if let Err(err) = self.write_block(body) {
            tracing::warn!(?phase, "failed to record datagram: {}", err);
        }
    }

    fn flush(&self) {
        if let Err(err) = self.out.lock().flush() {
            tracing::warn!("failed to flush recording: {}", err);
        }
    }
}

impl Drop for FileRecorder {
    fn drop(&mut self) {
        let _ = self.out.get_mut().flush();
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("netchan-{}-{}", std::process::id(), name))
    }

    #[test]
    fn writes_length_prefixed_bodies() {
        let path = temp_path("record.dm2");
        {
            let recorder = FileRecorder::create(&path).unwrap();
            recorder.record(RecordPhase::PreGameHeader, &[1, 0, 0, 0, 1, 0, 0, 0, 6, 6]);
            recorder.record(RecordPhase::InGame, &[2, 0, 0, 0, 1, 0, 0, 0, 7]);
            recorder.flush();
        }
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, 6, 6, 1, 0, 0, 0, 7]);
    }

    #[test]
    fn datagrams_shorter_than_the_header_are_skipped() {
        let path = temp_path("short.dm2");
        {
            let recorder = FileRecorder::create(&path).unwrap();
            recorder.record(RecordPhase::InGame, &[1, 2, 3]);
        }
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(bytes.is_empty());
    }
}

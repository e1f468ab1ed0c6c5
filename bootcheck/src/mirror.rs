//! Human-readable UART mirror for live tailing.
//!
//! Raw UART traffic contains firmware echo, carriage returns and binary noise.
//! [`UartSanitizer`] reduces it to printable ASCII, tab and single newlines;
//! [`UartMirror`] writes the result to a plain-text file that can be followed
//! with `tail -f` from another terminal.

use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::reader::UartSink;

/// Byte filter used by the mirror.
///
/// - `\r` is dropped.
/// - Runs of `\n` collapse into one.
/// - Tab and printable ASCII (0x20..=0x7E) pass through.
/// - Everything else is dropped.
#[derive(Debug, Default, Clone)]
pub struct UartSanitizer {
    last_was_newline: bool,
}

impl UartSanitizer {
    /// Create a sanitizer at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one byte, returning what should be written (if anything).
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        match byte {
            b'\r' => None,
            b'\n' if self.last_was_newline => None,
            b'\n' => {
                self.last_was_newline = true;
                Some(b'\n')
            },
            b'\t' | 0x20..=0x7E => {
                self.last_was_newline = false;
                Some(byte)
            },
            _ => None,
        }
    }

    /// Filter a whole slice.
    pub fn sanitize(&mut self, bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .filter_map(|b| self.push(*b))
            .collect()
    }
}

/// A mirror file shared between the reader thread and the session.
#[derive(Debug)]
pub struct UartMirror {
    path: PathBuf,
    ephemeral: bool,
    file: Arc<Mutex<Option<File>>>,
}

impl UartMirror {
    /// Create (or truncate) the mirror file at `path`.
    ///
    /// When `ephemeral` is set, the file is deleted again by [`UartMirror::close`].
    pub fn create(path: impl Into<PathBuf>, ephemeral: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!("Mirroring UART output to {}", path.display());

        Ok(Self {
            path,
            ephemeral,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Path of the mirror file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A sink feeding this mirror, to be handed to the reader thread.
    pub fn sink(&self) -> MirrorSink {
        MirrorSink {
            sanitizer: UartSanitizer::new(),
            file: Arc::clone(&self.file),
        }
    }

    /// Close the file and delete it if the mirror is ephemeral.
    ///
    /// Bytes that arrive after closing are discarded.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            guard.take();
        }

        if self.ephemeral && self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove UART mirror {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for UartMirror {
    fn drop(&mut self) {
        self.close();
    }
}

/// [`UartSink`] that writes sanitized bytes into a [`UartMirror`].
#[derive(Debug)]
pub struct MirrorSink {
    sanitizer: UartSanitizer,
    file: Arc<Mutex<Option<File>>>,
}

impl UartSink for MirrorSink {
    fn feed(&mut self, byte: u8) {
        let Some(out) = self.sanitizer.push(byte) else {
            return;
        };

        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                // Best effort; the mirror never affects the protocol run.
                let _ = file
                    .write_all(&[out])
                    .and_then(|()| file.flush());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_strips_cr_and_collapses_newlines() {
        let mut s = UartSanitizer::new();
        assert_eq!(s.sanitize(b"BOOT?\r\n\r\n\nOK\n"), b"BOOT?\nOK\n");
    }

    #[test]
    fn test_sanitize_drops_binary_keeps_tab() {
        let mut s = UartSanitizer::new();
        assert_eq!(s.sanitize(b"A\x00\x07\tB\xFF\x1bC"), b"A\tBC");
    }

    #[test]
    fn test_dropped_bytes_do_not_reset_newline_state() {
        let mut s = UartSanitizer::new();
        assert_eq!(s.sanitize(b"x\n\x00\n"), b"x\n");
    }

    #[test]
    fn test_leading_newline_is_kept() {
        let mut s = UartSanitizer::new();
        assert_eq!(s.sanitize(b"\n\nA"), b"\nA");
    }

    #[test]
    fn test_mirror_truncates_and_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uart.log");
        fs::write(&path, "stale content").unwrap();

        let mirror = UartMirror::create(&path, false).unwrap();
        let mut sink = mirror.sink();
        for b in b"READY\r\n\x01" {
            sink.feed(*b);
        }
        mirror.close();

        assert_eq!(fs::read_to_string(&path).unwrap(), "READY\n");
        sink.feed(b'Z');
        assert_eq!(fs::read_to_string(&path).unwrap(), "READY\n");
    }

    #[test]
    fn test_ephemeral_mirror_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.log");

        let mirror = UartMirror::create(&path, true).unwrap();
        assert!(path.exists());
        drop(mirror);
        assert!(!path.exists());
    }
}

//! Byte transmission to the target.
//!
//! Every write is flushed immediately. Paced sends deliver one byte per write
//! with a fixed delay between bytes, so the target observes byte-at-a-time
//! reception instead of bulk pipe writes.

use log::trace;
use std::io::Write;
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Writer side of the UART link.
#[derive(Debug)]
pub struct ByteTransmitter<W: Write> {
    writer: W,
    cancel: CancelToken,
}

impl<W: Write> ByteTransmitter<W> {
    /// Wrap a writer (typically the target's stdin).
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            cancel: CancelToken::new(),
        }
    }

    /// Stop paced sends early when `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get a reference to the underlying writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Consume the transmitter and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write `data` in one go and flush.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {} bytes", data.len());
        self.write_flush(data)
            .map_err(|source| Error::Transmission {
                index: None,
                source,
            })
    }

    /// Write a text command and flush.
    pub fn send_str(&mut self, text: &str) -> Result<()> {
        self.send(text.as_bytes())
    }

    /// Write `data` one byte at a time, sleeping `delay` after each byte.
    pub fn send_paced(&mut self, data: &[u8], delay: Duration) -> Result<()> {
        self.send_paced_with_progress(data, delay, usize::MAX, |_, _| {})
    }

    /// Like [`send_paced`](Self::send_paced), reporting `(sent, total)` every
    /// `every` bytes and once more when the payload is complete.
    ///
    /// A failed write aborts immediately; the error carries the byte index.
    pub fn send_paced_with_progress<F>(
        &mut self,
        data: &[u8],
        delay: Duration,
        every: usize,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total = data.len();
        let every = every.max(1);

        for (i, byte) in data.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }

            self.write_flush(std::slice::from_ref(byte))
                .map_err(|source| Error::Transmission {
                    index: Some(i),
                    source,
                })?;

            if i % every == 0 {
                progress(i, total);
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        progress(total, total);
        Ok(())
    }

    fn write_flush(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Instant;

    /// Accepts `limit` bytes, then fails every write.
    struct LimitedWriter {
        written: Vec<u8>,
        limit: usize,
        flushes: usize,
    }

    impl LimitedWriter {
        fn new(limit: usize) -> Self {
            Self {
                written: Vec::new(),
                limit,
                flushes: 0,
            }
        }
    }

    impl Write for LimitedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() >= self.limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "target gone"));
            }
            let n = buf.len().min(self.limit - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_send_writes_and_flushes() {
        let mut tx = ByteTransmitter::new(LimitedWriter::new(usize::MAX));
        tx.send_str("u").unwrap();
        tx.send(&[0u8; 4]).unwrap();

        let w = tx.into_inner();
        assert_eq!(w.written, b"u\0\0\0\0");
        assert_eq!(w.flushes, 2);
    }

    #[test]
    fn test_paced_send_flushes_every_byte() {
        let mut tx = ByteTransmitter::new(LimitedWriter::new(usize::MAX));
        tx.send_paced(b"SEND 1024\n", Duration::ZERO).unwrap();

        let w = tx.into_inner();
        assert_eq!(w.written, b"SEND 1024\n");
        assert_eq!(w.flushes, 10);
    }

    #[test]
    fn test_paced_send_respects_delay() {
        let mut tx = ByteTransmitter::new(Vec::new());
        let start = Instant::now();
        tx.send_paced(&[1, 2, 3, 4, 5], Duration::from_millis(10))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(tx.writer(), &vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_failure_reports_byte_index() {
        let mut tx = ByteTransmitter::new(LimitedWriter::new(7));
        let data: Vec<u8> = (0..20).collect();

        match tx.send_paced(&data, Duration::ZERO) {
            Err(Error::Transmission { index, .. }) => assert_eq!(index, Some(7)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_progress_every_n_bytes_and_at_end() {
        let mut tx = ByteTransmitter::new(Vec::new());
        let data = vec![0xAAu8; 100];
        let mut calls = Vec::new();

        tx.send_paced_with_progress(&data, Duration::ZERO, 40, |sent, total| {
            calls.push((sent, total));
        })
        .unwrap();

        assert_eq!(calls, vec![(0, 100), (40, 100), (80, 100), (100, 100)]);
    }

    #[test]
    fn test_cancelled_send_stops() {
        let cancel = CancelToken::new();
        let mut tx = ByteTransmitter::new(Vec::new()).with_cancel(cancel.clone());
        cancel.cancel();

        assert!(matches!(
            tx.send_paced(b"abc", Duration::ZERO),
            Err(Error::Interrupted)
        ));
        assert!(tx.writer().is_empty());
    }
}

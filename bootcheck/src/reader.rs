//! Background UART reader.
//!
//! The target's output is read one byte at a time on a dedicated thread and
//! forwarded over a channel, so the protocol logic never blocks on a pipe.
//!
//! ```text
//!  child stdout ──read(1)──> [uart-reader thread] ──UartEvent──> PatternWaiter
//!                                   │
//!                                   └──> UartSink (optional mirror)
//! ```

use log::{debug, trace};
use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;

/// One item delivered by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartEvent {
    /// A byte received from the target.
    Byte(u8),
    /// The source reached end-of-stream or failed. Nothing follows this.
    Closed,
}

/// Side channel that observes every received byte in order.
pub trait UartSink: Send {
    /// Observe one byte.
    fn feed(&mut self, byte: u8);
}

/// Handle to the background reader thread.
#[derive(Debug)]
pub struct ByteStreamReader {
    handle: Option<JoinHandle<()>>,
}

impl ByteStreamReader {
    /// Start reading `source` on a new thread.
    ///
    /// Returns the handle and the receiving end of the byte queue. The thread
    /// is never joined implicitly, so it does not keep the process alive.
    pub fn spawn<R>(
        source: R,
        sink: Option<Box<dyn UartSink>>,
    ) -> Result<(Self, Receiver<UartEvent>)>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("uart-reader".into())
            .spawn(move || read_loop(source, sink, &tx))?;

        Ok((
            Self {
                handle: Some(handle),
            },
            rx,
        ))
    }

    /// Whether the reader thread has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `grace` for the thread to stop, then detach it.
    ///
    /// Returns `true` if the thread was joined.
    pub fn finish(mut self, grace: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() >= grace {
                debug!("UART reader still blocked after {grace:?}, detaching");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        handle.join().is_ok()
    }
}

fn read_loop<R: Read>(mut source: R, mut sink: Option<Box<dyn UartSink>>, tx: &Sender<UartEvent>) {
    let mut byte = [0u8; 1];

    loop {
        match source.read(&mut byte) {
            Ok(0) => {
                debug!("UART stream closed");
                break;
            },
            Ok(_) => {
                if let Some(sink) = sink.as_mut() {
                    sink.feed(byte[0]);
                }
                if tx.send(UartEvent::Byte(byte[0])).is_err() {
                    // Consumer is gone; nobody will read the Closed marker either.
                    return;
                }
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => {
                // The pipe may be torn down by process termination mid-read.
                trace!("UART read error (treated as end of stream): {e}");
                break;
            },
        }
    }

    let _ = tx.send(UartEvent::Closed);
}

//! Token waiting on the UART byte queue.
//!
//! A wait consumes bytes from the reader channel into a fresh buffer until the
//! target token appears, a forbidden token appears, the stream closes, or the
//! deadline passes. The deadline is checked around a short `recv_timeout`, so
//! no timer thread is needed.
//!
//! Bytes left unconsumed after a match stay in the queue for the next wait, but
//! a partially received token is *not* carried over: each wait starts with an
//! empty buffer, so a token split across two waits is not detected.

use log::{debug, trace};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::reader::UartEvent;

/// Interval between queue polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Elapsed time before a progress indicator appears.
pub const PROGRESS_DELAY: Duration = Duration::from_millis(200);

/// Waits shorter than this never show progress.
pub const PROGRESS_MIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// The target token was seen.
    Matched,
    /// A forbidden token was seen first.
    Forbidden(String),
    /// The reader delivered its end-of-stream marker.
    Closed,
    /// The deadline passed.
    TimedOut,
    /// The run was cancelled.
    Interrupted,
}

/// Result of a single wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    /// How the wait ended.
    pub status: WaitStatus,
    /// Bytes received during the wait, decoded as ASCII (other bytes dropped).
    pub captured: String,
}

impl WaitOutcome {
    /// Whether the target token was seen.
    pub fn matched(&self) -> bool {
        self.status == WaitStatus::Matched
    }

    /// Convert into a `Result`, naming `token` and `timeout` in the error.
    pub fn into_result(self, token: &str, timeout: Duration) -> Result<String> {
        let captured = self.captured;
        match self.status {
            WaitStatus::Matched => Ok(captured),
            WaitStatus::Forbidden(forbidden) => Err(Error::ProtocolViolation {
                expected: token.to_string(),
                forbidden,
                captured,
            }),
            WaitStatus::Closed => Err(Error::StreamClosed {
                token: token.to_string(),
                captured,
            }),
            WaitStatus::TimedOut => Err(Error::Timeout {
                token: token.to_string(),
                timeout,
                captured,
            }),
            WaitStatus::Interrupted => Err(Error::Interrupted),
        }
    }
}

/// Observer for time-based wait progress.
pub trait ProgressSink {
    /// Report progress as a fraction of the timeout in `0.0..=1.0`.
    fn update(&mut self, fraction: f64);

    /// Erase whatever `update` rendered.
    fn clear(&mut self);
}

/// A [`ProgressSink`] that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _fraction: f64) {}

    fn clear(&mut self) {}
}

/// Progress fraction to display for a wait, or `None` while it should stay hidden.
///
/// Only waits longer than [`PROGRESS_MIN_TIMEOUT`] show progress, and only after
/// [`PROGRESS_DELAY`] has elapsed.
pub fn progress_fraction(elapsed: Duration, timeout: Duration) -> Option<f64> {
    if timeout <= PROGRESS_MIN_TIMEOUT || elapsed <= PROGRESS_DELAY {
        return None;
    }
    Some((elapsed.as_secs_f64() / timeout.as_secs_f64()).min(1.0))
}

/// Consumer side of the UART byte queue.
#[derive(Debug)]
pub struct PatternWaiter {
    rx: Receiver<UartEvent>,
    closed: bool,
    cancel: CancelToken,
}

impl PatternWaiter {
    /// Wrap the receiving end of a reader channel.
    pub fn new(rx: Receiver<UartEvent>) -> Self {
        Self {
            rx,
            closed: false,
            cancel: CancelToken::new(),
        }
    }

    /// Stop waits early when `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether the end-of-stream marker has been seen.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for `pattern` to appear within `timeout`.
    pub fn wait_for(&mut self, pattern: &str, timeout: Duration) -> WaitOutcome {
        self.wait_inner(pattern, timeout, &[], &mut NoProgress, false)
    }

    /// Wait for `pattern`, failing early on any of `forbidden`, with progress.
    ///
    /// Forbidden tokens are checked before the target after every byte, so if
    /// both complete on the same byte the outcome is [`WaitStatus::Forbidden`].
    pub fn wait_for_with_progress<P>(
        &mut self,
        pattern: &str,
        timeout: Duration,
        forbidden: &[&str],
        progress: &mut P,
    ) -> WaitOutcome
    where
        P: ProgressSink + ?Sized,
    {
        self.wait_inner(pattern, timeout, forbidden, progress, true)
    }

    fn wait_inner<P>(
        &mut self,
        pattern: &str,
        timeout: Duration,
        forbidden: &[&str],
        progress: &mut P,
        show_progress: bool,
    ) -> WaitOutcome
    where
        P: ProgressSink + ?Sized,
    {
        debug!("Waiting for {pattern:?} ({:.1}s)", timeout.as_secs_f64());

        let start = Instant::now();
        let deadline = start + timeout;
        let target = pattern.as_bytes();
        let mut buf: Vec<u8> = Vec::new();
        let mut progress_shown = false;

        let status = loop {
            let now = Instant::now();
            if now >= deadline {
                break WaitStatus::TimedOut;
            }
            if self.cancel.is_cancelled() {
                break WaitStatus::Interrupted;
            }

            if show_progress {
                if let Some(fraction) = progress_fraction(now - start, timeout) {
                    progress.update(fraction);
                    progress_shown = true;
                }
            }

            if self.closed {
                break WaitStatus::Closed;
            }

            match self
                .rx
                .recv_timeout(POLL_INTERVAL.min(deadline - now))
            {
                Ok(UartEvent::Byte(byte)) => {
                    buf.push(byte);

                    // Checked after every byte, so a suffix test finds any new occurrence.
                    if let Some(hit) = forbidden
                        .iter()
                        .find(|f| buf.ends_with(f.as_bytes()))
                    {
                        break WaitStatus::Forbidden((*hit).to_string());
                    }
                    if buf.ends_with(target) {
                        break WaitStatus::Matched;
                    }
                },
                Ok(UartEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                    break WaitStatus::Closed;
                },
                Err(RecvTimeoutError::Timeout) => {},
            }
        };

        if progress_shown {
            progress.clear();
        }

        trace!(
            "Wait for {pattern:?} ended with {status:?} after {:?} ({} bytes)",
            start.elapsed(),
            buf.len()
        );

        WaitOutcome {
            status,
            captured: decode_ascii(&buf),
        }
    }
}

/// Decode bytes as ASCII, dropping anything outside 0x00..=0x7F.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|b| char::from(*b))
        .collect()
}

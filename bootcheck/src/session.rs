//! Per-run session context.
//!
//! A [`ProtocolSession`] owns everything with a lifetime of one run: the target
//! process, the reader thread, the waiter, the transmitter and the UART mirror.
//! Closing it (explicitly or on drop) always terminates the target and drains
//! the reader, whichever path the run took.

use log::{debug, warn};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::mirror::UartMirror;
use crate::reader::{ByteStreamReader, UartSink};
use crate::target::{TERMINATE_GRACE, TargetLink, TargetProcess};
use crate::transmit::ByteTransmitter;
use crate::waiter::PatternWaiter;

/// Pause after starting the reader so it is blocked in `read` before the
/// first wait begins.
pub const READER_SETTLE: Duration = Duration::from_millis(30);

/// How long cleanup waits for the reader thread to see end-of-stream.
pub const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Default delay between firmware bytes.
pub const DEFAULT_BYTE_DELAY: Duration = Duration::from_micros(300);

/// Deadlines for each protocol wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimeouts {
    /// `BOOT?` after launch.
    pub boot_prompt: Duration,
    /// `OK` after the update command.
    pub update_ack: Duration,
    /// `READY` after the `SEND` line.
    pub flash_ready: Duration,
    /// `CRC?` after the payload.
    pub crc_prompt: Duration,
    /// `OK` after `CRC?`.
    pub crc_ok: Duration,
    /// `REBOOT` (best effort).
    pub reboot: Duration,
    /// `APP_BOOT` banner.
    pub app_boot: Duration,
    /// `App:` heartbeat.
    pub app_heartbeat: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            boot_prompt: Duration::from_secs(3),
            update_ack: Duration::from_secs(3),
            flash_ready: Duration::from_secs(5),
            crc_prompt: Duration::from_secs(20),
            crc_ok: Duration::from_secs(20),
            reboot: Duration::from_secs(2),
            app_boot: Duration::from_secs(5),
            app_heartbeat: Duration::from_secs(5),
        }
    }
}

/// UART mirror file settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// File receiving sanitized UART output.
    pub path: PathBuf,
    /// Delete the file when the session ends.
    pub ephemeral: bool,
}

/// Settings for one protocol run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pause before key protocol steps, for narrated demos.
    pub step_delay: Duration,
    /// Delay between firmware bytes during upload.
    pub byte_delay: Duration,
    /// Optional UART mirror.
    pub mirror: Option<MirrorConfig>,
    /// Firmware size hint.
    pub firmware_size: Option<usize>,
    /// Per-wait deadlines.
    pub timeouts: ProtocolTimeouts,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::ZERO,
            byte_delay: DEFAULT_BYTE_DELAY,
            mirror: None,
            firmware_size: None,
            timeouts: ProtocolTimeouts::default(),
        }
    }
}

impl SessionConfig {
    /// Set the step delay in seconds; negative or non-finite values mean none.
    #[must_use]
    pub fn with_step_delay_secs(mut self, secs: f64) -> Self {
        self.step_delay = secs_to_duration(secs);
        self
    }

    /// Set the firmware byte delay in seconds; negative or non-finite values mean none.
    #[must_use]
    pub fn with_byte_delay_secs(mut self, secs: f64) -> Self {
        self.byte_delay = secs_to_duration(secs);
        self
    }

    /// Mirror UART output to `path`.
    #[must_use]
    pub fn with_mirror(mut self, path: impl Into<PathBuf>, ephemeral: bool) -> Self {
        self.mirror = Some(MirrorConfig {
            path: path.into(),
            ephemeral,
        });
        self
    }
}

/// Clamp a user-supplied number of seconds to a valid `Duration`.
pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Live resources of one run.
pub struct ProtocolSession {
    waiter: PatternWaiter,
    transmitter: ByteTransmitter<Box<dyn Write + Send>>,
    reader: Option<ByteStreamReader>,
    process: Option<Box<dyn TargetProcess>>,
    mirror: Option<UartMirror>,
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("pid", &self.process.as_ref().and_then(|p| p.id()))
            .field("reader_running", &self.reader.is_some())
            .field("mirror", &self.mirror.as_ref().map(UartMirror::path))
            .finish_non_exhaustive()
    }
}

impl ProtocolSession {
    /// Start the reader on `link` and wire up waiter and transmitter.
    pub fn start(link: TargetLink, mirror: Option<UartMirror>, cancel: &CancelToken) -> Result<Self> {
        let TargetLink {
            output,
            input,
            process,
        } = link;

        let sink = mirror
            .as_ref()
            .map(|m| Box::new(m.sink()) as Box<dyn UartSink>);

        let (reader, rx) = match ByteStreamReader::spawn(output, sink) {
            Ok(started) => started,
            Err(e) => {
                let mut process = process;
                let _ = process.terminate(TERMINATE_GRACE);
                return Err(e);
            },
        };
        thread::sleep(READER_SETTLE);

        Ok(Self {
            waiter: PatternWaiter::new(rx).with_cancel(cancel.clone()),
            transmitter: ByteTransmitter::new(input).with_cancel(cancel.clone()),
            reader: Some(reader),
            process: Some(process),
            mirror,
        })
    }

    /// The token waiter.
    pub fn waiter(&mut self) -> &mut PatternWaiter {
        &mut self.waiter
    }

    /// The transmitter.
    pub fn transmitter(&mut self) -> &mut ByteTransmitter<Box<dyn Write + Send>> {
        &mut self.transmitter
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.process.is_none() && self.reader.is_none()
    }

    /// Terminate the target, drain the reader and close the mirror. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.terminate(TERMINATE_GRACE) {
                warn!("Failed to terminate target: {e}");
            }
        }

        if let Some(reader) = self.reader.take() {
            if !reader.finish(READER_DRAIN_GRACE) {
                debug!("UART reader detached");
            }
        }

        if let Some(mirror) = self.mirror.take() {
            mirror.close();
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.close();
    }
}

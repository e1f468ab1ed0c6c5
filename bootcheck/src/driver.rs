//! Protocol driver.
//!
//! Runs the fixed seven-step boot/update sequence against a launched target:
//!
//! ```text
//! host                         target
//!  |         (launch)            |
//!  | <---------------- BOOT?     |
//!  | u --------------->          |
//!  | <---------------- OK        |
//!  | SEND <len>\n ---->          |
//!  | <---------------- READY     |
//!  | <len> bytes ----->          |
//!  | 32 x 0x00 ------->          |
//!  | <---------------- CRC?      |
//!  | <---------------- OK        |   APP_BOOT / App: here is a violation
//!  | <---------------- REBOOT    |   (best effort)
//!  | <---------------- APP_BOOT  |
//!  | <---------------- App:      |
//! ```
//!
//! The first unmet expectation ends the run. There are no retries. The target is
//! terminated on every exit path.

use log::{debug, info, warn};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareBuilder, FirmwareImage};
use crate::mirror::UartMirror;
use crate::session::{ProtocolSession, SessionConfig};
use crate::target::Launcher;
use crate::waiter::{POLL_INTERVAL, ProgressSink};

/// Bootloader prompt after reset.
pub const BOOT_PROMPT: &str = "BOOT?";
/// Generic acknowledgement.
pub const ACK: &str = "OK";
/// Flash erased, payload may follow.
pub const FLASH_READY: &str = "READY";
/// Bootloader is verifying the payload.
pub const CRC_PROMPT: &str = "CRC?";
/// Bootloader is handing over to the application.
pub const REBOOT: &str = "REBOOT";
/// Application banner.
pub const APP_BOOT: &str = "APP_BOOT";
/// Application heartbeat prefix.
pub const APP_HEARTBEAT: &str = "App:";
/// Command that enters update mode.
pub const UPDATE_COMMAND: &str = "u";
/// Zero bytes sent after the payload.
pub const TRAILER_LEN: usize = 32;

/// Tokens that must not appear before the CRC acknowledgement.
pub const EARLY_APP_TOKENS: [&str; 2] = [APP_BOOT, APP_HEARTBEAT];

const LAUNCH_SETTLE: Duration = Duration::from_millis(200);
const COMMAND_SETTLE: Duration = Duration::from_millis(30);
const COMMAND_CHAR_DELAY: Duration = Duration::from_millis(1);

/// Upload progress callback interval in bytes.
pub const UPLOAD_PROGRESS_EVERY: usize = 40;
const UPLOAD_PROGRESS_MIN_ESTIMATE: Duration = Duration::from_millis(500);
const UPLOAD_PROGRESS_DELAY: Duration = Duration::from_millis(200);

const BOOT_PREVIEW_CHARS: usize = 50;
const APP_PREVIEW_CHARS: usize = 120;

/// Protocol steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Start the emulated target.
    Launch,
    /// Wait for `BOOT?`.
    AwaitBootPrompt,
    /// Send `u`, wait for `OK`.
    EnterUpdateMode,
    /// Produce the firmware image.
    BuildFirmware,
    /// `SEND`, `READY`, payload and trailer.
    UploadFirmware,
    /// `CRC?` then `OK` with no application output in between.
    ValidateCrc,
    /// `REBOOT`, `APP_BOOT`, `App:`.
    Finalize,
}

impl Step {
    /// Number of steps in a run.
    pub const TOTAL: usize = 7;

    /// All steps in execution order.
    pub const ALL: [Step; Self::TOTAL] = [
        Step::Launch,
        Step::AwaitBootPrompt,
        Step::EnterUpdateMode,
        Step::BuildFirmware,
        Step::UploadFirmware,
        Step::ValidateCrc,
        Step::Finalize,
    ];

    /// 1-based position.
    pub fn number(self) -> usize {
        match self {
            Step::Launch => 1,
            Step::AwaitBootPrompt => 2,
            Step::EnterUpdateMode => 3,
            Step::BuildFirmware => 4,
            Step::UploadFirmware => 5,
            Step::ValidateCrc => 6,
            Step::Finalize => 7,
        }
    }

    /// Short description for progress output.
    pub fn title(self) -> &'static str {
        match self {
            Step::Launch => "Starting emulated bootloader",
            Step::AwaitBootPrompt => "Waiting for bootloader",
            Step::EnterUpdateMode => "Entering update mode",
            Step::BuildFirmware => "Generating test application",
            Step::UploadFirmware => "Uploading firmware",
            Step::ValidateCrc => "Validating CRC",
            Step::Finalize => "Finalizing",
        }
    }

    /// Stable identifier for machine-readable output.
    pub fn id(self) -> &'static str {
        match self {
            Step::Launch => "launch",
            Step::AwaitBootPrompt => "await_boot_prompt",
            Step::EnterUpdateMode => "enter_update_mode",
            Step::BuildFirmware => "build_firmware",
            Step::UploadFirmware => "upload_firmware",
            Step::ValidateCrc => "validate_crc",
            Step::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.number(), Self::TOTAL, self.title())
    }
}

/// Why a run failed.
#[derive(Debug)]
pub struct Failure {
    /// Step that failed.
    pub step: Step,
    /// Human-readable reason, with a captured-output preview where useful.
    pub reason: String,
    /// Underlying error.
    pub error: Error,
}

impl Failure {
    fn new(step: Step, reason: impl Into<String>, error: Error) -> Self {
        let reason = if matches!(error, Error::Interrupted) {
            "Test interrupted".to_string()
        } else {
            reason.into()
        };
        Self {
            step,
            reason,
            error,
        }
    }

    /// Text captured by the failing wait, if any.
    pub fn captured(&self) -> Option<&str> {
        self.error.captured()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (step {}: {})", self.reason, self.step.number(), self.error)
    }
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum Verdict {
    /// Every required token arrived in order.
    Pass,
    /// The first unmet condition.
    Fail(Failure),
}

impl Verdict {
    /// Whether the run passed.
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// The failure, if the run failed.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail(failure) => Some(failure),
        }
    }

    /// Process exit code: 0 on pass, 1 on failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_pass() { 0 } else { 1 }
    }
}

/// Observer for run progress.
///
/// Wait progress for the CRC acknowledgement arrives through the
/// [`ProgressSink`] supertrait.
pub trait Reporter: ProgressSink {
    /// A step is starting.
    fn step(&mut self, step: Step);

    /// Something succeeded.
    fn ok(&mut self, message: &str);

    /// Something non-fatal went wrong.
    fn warn(&mut self, message: &str);

    /// Something failed. Called once for the failure that ends a run, and for
    /// firmware load errors that the run recovers from.
    fn fail(&mut self, message: &str);

    /// Firmware upload progress. Only called for uploads slow enough to watch.
    fn upload_progress(&mut self, _sent: usize, _total: usize) {}

    /// Upload progress should be erased.
    fn upload_done(&mut self) {}
}

/// A [`Reporter`] that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressSink for NullReporter {
    fn update(&mut self, _fraction: f64) {}

    fn clear(&mut self) {}
}

impl Reporter for NullReporter {
    fn step(&mut self, _step: Step) {}

    fn ok(&mut self, _message: &str) {}

    fn warn(&mut self, _message: &str) {}

    fn fail(&mut self, _message: &str) {}
}

/// Whether upload progress should be displayed.
///
/// Uploads expected to take under half a second stay silent, and nothing is
/// drawn during the first 200ms.
pub fn upload_progress_visible(total: usize, byte_delay: Duration, elapsed: Duration) -> bool {
    #[allow(clippy::cast_precision_loss)]
    let estimate = byte_delay.as_secs_f64() * total as f64;
    estimate > UPLOAD_PROGRESS_MIN_ESTIMATE.as_secs_f64() && elapsed > UPLOAD_PROGRESS_DELAY
}

type StepResult<T> = std::result::Result<T, Failure>;

fn enter(reporter: &mut dyn Reporter, step: Step) {
    info!("{step}");
    reporter.step(step);
}

/// Runs the boot/update sequence.
pub struct ProtocolDriver<L: Launcher> {
    launcher: L,
    firmware: FirmwareBuilder,
    config: SessionConfig,
    cancel: CancelToken,
}

impl<L: Launcher> fmt::Debug for ProtocolDriver<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDriver")
            .field("firmware", &self.firmware)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<L: Launcher> ProtocolDriver<L> {
    /// Driver using `launcher` to start targets.
    pub fn new(launcher: L, firmware: FirmwareBuilder, config: SessionConfig) -> Self {
        Self {
            launcher,
            firmware,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Abort waits and uploads when `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get a reference to the launcher.
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run the whole sequence once.
    pub fn run(&self, reporter: &mut dyn Reporter) -> Verdict {
        self.launcher.sweep();

        match self.run_steps(reporter) {
            Ok(()) => {
                info!("Boot/update sequence passed");
                Verdict::Pass
            },
            Err(failure) => {
                info!("Run failed at step {}: {}", failure.step.number(), failure.error);
                reporter.fail(&failure.reason);
                Verdict::Fail(failure)
            },
        }
    }

    fn run_steps(&self, reporter: &mut dyn Reporter) -> StepResult<()> {
        enter(reporter, Step::Launch);
        let mut session = self.launch(reporter)?;

        enter(reporter, Step::AwaitBootPrompt);
        self.await_boot_prompt(&mut session)?;
        reporter.ok("Bootloader ready");

        enter(reporter, Step::EnterUpdateMode);
        self.enter_update_mode(&mut session)?;
        reporter.ok("Update mode active");

        enter(reporter, Step::BuildFirmware);
        let image = self.build_firmware(reporter);
        reporter.ok("Test application ready");

        enter(reporter, Step::UploadFirmware);
        self.upload(&mut session, &image, reporter)?;

        enter(reporter, Step::ValidateCrc);
        self.validate_crc(&mut session, reporter)?;
        reporter.ok("CRC validation passed");

        enter(reporter, Step::Finalize);
        self.finalize(&mut session, reporter)?;

        session.close();
        Ok(())
    }

    fn launch(&self, reporter: &mut dyn Reporter) -> StepResult<ProtocolSession> {
        let mirror = self
            .config
            .mirror
            .as_ref()
            .map(|m| UartMirror::create(&m.path, m.ephemeral))
            .transpose()
            .map_err(|e| Failure::new(Step::Launch, format!("Cannot create UART mirror: {e}"), e))?;

        let link = self
            .launcher
            .launch()
            .map_err(|e| Failure::new(Step::Launch, e.to_string(), e))?;
        thread::sleep(LAUNCH_SETTLE);
        reporter.ok("Emulator running");

        ProtocolSession::start(link, mirror, &self.cancel)
            .map_err(|e| Failure::new(Step::Launch, format!("Cannot read target output: {e}"), e))
    }

    fn await_boot_prompt(&self, session: &mut ProtocolSession) -> StepResult<()> {
        let timeout = self.config.timeouts.boot_prompt;
        session
            .waiter()
            .wait_for(BOOT_PROMPT, timeout)
            .into_result(BOOT_PROMPT, timeout)
            .map(drop)
            .map_err(|e| {
                let preview = e.captured_preview(BOOT_PREVIEW_CHARS).unwrap_or_default();
                Failure::new(
                    Step::AwaitBootPrompt,
                    format!("No BOOT? prompt (got: {preview:?})"),
                    e,
                )
            })
    }

    fn enter_update_mode(&self, session: &mut ProtocolSession) -> StepResult<()> {
        let step = Step::EnterUpdateMode;
        self.pause().map_err(|e| Failure::new(step, "", e))?;
        session
            .transmitter()
            .send_str(UPDATE_COMMAND)
            .map_err(|e| Failure::new(step, e.to_string(), e))?;
        thread::sleep(COMMAND_SETTLE);

        let timeout = self.config.timeouts.update_ack;
        session
            .waiter()
            .wait_for(ACK, timeout)
            .into_result(ACK, timeout)
            .map(drop)
            .map_err(|e| Failure::new(step, "Update mode failed", e))
    }

    fn build_firmware(&self, reporter: &mut dyn Reporter) -> FirmwareImage {
        match self.firmware.produce(self.config.firmware_size) {
            Ok(image) => {
                info!(
                    "Firmware: {} bytes, CRC32 0x{:08X}, from {}",
                    image.len(),
                    image.crc32(),
                    image.origin()
                );
                image
            },
            Err(e) => {
                warn!("Firmware unavailable: {e}");
                reporter.fail(&format!("{e}; using synthesized firmware"));
                FirmwareImage::synthesize(
                    self.config
                        .firmware_size
                        .unwrap_or(crate::firmware::DEFAULT_FIRMWARE_SIZE),
                )
            },
        }
    }

    fn upload(
        &self,
        session: &mut ProtocolSession,
        image: &FirmwareImage,
        reporter: &mut dyn Reporter,
    ) -> StepResult<()> {
        let step = Step::UploadFirmware;
        let command = format!("SEND {}\n", image.len());

        self.pause().map_err(|e| Failure::new(step, "", e))?;
        session
            .transmitter()
            .send_paced(command.as_bytes(), COMMAND_CHAR_DELAY)
            .map_err(|e| Failure::new(step, e.to_string(), e))?;
        thread::sleep(COMMAND_SETTLE);

        let timeout = self.config.timeouts.flash_ready;
        session
            .waiter()
            .wait_for(FLASH_READY, timeout)
            .into_result(FLASH_READY, timeout)
            .map_err(|e| Failure::new(step, "Flash not ready", e))?;
        reporter.ok("Flash erased, ready for data");

        let byte_delay = self.config.byte_delay;
        let started = Instant::now();
        let mut shown = false;
        let sent = session.transmitter().send_paced_with_progress(
            image.bytes(),
            byte_delay,
            UPLOAD_PROGRESS_EVERY,
            |done, total| {
                if upload_progress_visible(total, byte_delay, started.elapsed()) {
                    reporter.upload_progress(done, total);
                    shown = true;
                }
            },
        );
        if shown {
            reporter.upload_done();
        }
        sent.map_err(|e| Failure::new(step, e.to_string(), e))?;
        reporter.ok(&format!("Uploaded {} bytes", image.len()));

        session
            .transmitter()
            .send(&[0u8; TRAILER_LEN])
            .map_err(|e| Failure::new(step, e.to_string(), e))?;
        debug!("Sent {TRAILER_LEN}-byte trailer");
        Ok(())
    }

    fn validate_crc(
        &self,
        session: &mut ProtocolSession,
        reporter: &mut dyn Reporter,
    ) -> StepResult<()> {
        let step = Step::ValidateCrc;
        let timeouts = self.config.timeouts;

        session
            .waiter()
            .wait_for(CRC_PROMPT, timeouts.crc_prompt)
            .into_result(CRC_PROMPT, timeouts.crc_prompt)
            .map_err(|e| Failure::new(step, "CRC check timeout", e))?;

        session
            .waiter()
            .wait_for_with_progress(ACK, timeouts.crc_ok, &EARLY_APP_TOKENS, reporter)
            .into_result(ACK, timeouts.crc_ok)
            .map(drop)
            .map_err(|e| {
                let reason = if e.is_protocol_violation() {
                    "Protocol violation: app started before CRC completed"
                } else {
                    "CRC validation failed"
                };
                Failure::new(step, reason, e)
            })
    }

    fn finalize(&self, session: &mut ProtocolSession, reporter: &mut dyn Reporter) -> StepResult<()> {
        let step = Step::Finalize;
        let timeouts = self.config.timeouts;

        // REBOOT is informational; the application tokens below decide the outcome.
        match session
            .waiter()
            .wait_for(REBOOT, timeouts.reboot)
            .into_result(REBOOT, timeouts.reboot)
        {
            Ok(_) => reporter.ok("Reboot initiated"),
            Err(Error::Interrupted) => return Err(Failure::new(step, "", Error::Interrupted)),
            Err(e) => {
                warn!("REBOOT not observed: {e}");
                reporter.warn("REBOOT not observed, continuing");
            },
        }

        reporter.ok("Waiting for application output...");
        self.expect_app_token(session, APP_BOOT, timeouts.app_boot, "Application output not detected")?;
        reporter.ok("Application boot banner detected");

        self.expect_app_token(
            session,
            APP_HEARTBEAT,
            timeouts.app_heartbeat,
            "Application heartbeat not detected",
        )?;
        reporter.ok("Application heartbeat detected");
        Ok(())
    }

    fn expect_app_token(
        &self,
        session: &mut ProtocolSession,
        token: &str,
        timeout: Duration,
        reason: &str,
    ) -> StepResult<()> {
        session
            .waiter()
            .wait_for(token, timeout)
            .into_result(token, timeout)
            .map(drop)
            .map_err(|e| {
                let preview = e.captured_preview(APP_PREVIEW_CHARS).unwrap_or_default();
                Failure::new(Step::Finalize, format!("{reason} (got: {preview:?})"), e)
            })
    }

    /// Presentation delay before a host command, cut short by cancellation.
    fn pause(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.step_delay;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

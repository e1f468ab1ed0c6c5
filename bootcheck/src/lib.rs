//! # bootcheck
//!
//! A library for validating a bootloader's UART update protocol against an
//! emulated target.
//!
//! The target's UART is its process stdio. A reader thread feeds device output
//! into a byte queue, a waiter consumes the queue looking for protocol tokens,
//! and a transmitter writes commands and firmware bytes back. The driver ties
//! these together into a fixed seven-step sequence:
//!
//! - launch the emulator
//! - wait for `BOOT?`
//! - enter update mode (`u` / `OK`)
//! - produce a firmware image and its CRC-32
//! - upload it (`SEND <len>` / `READY`, paced bytes, zero trailer)
//! - validate the CRC (`CRC?` / `OK`, with no application output in between)
//! - confirm the application boots (`APP_BOOT`, `App:`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootcheck::{
//!     FirmwareBuilder, LaunchConfig, NullReporter, ProtocolDriver, QemuLauncher, SessionConfig,
//! };
//!
//! let driver = ProtocolDriver::new(
//!     QemuLauncher::new(LaunchConfig::default()),
//!     FirmwareBuilder::default(),
//!     SessionConfig::default().with_mirror("uart.log", true),
//! );
//!
//! let verdict = driver.run(&mut NullReporter);
//! std::process::exit(verdict.exit_code());
//! ```

pub mod cancel;
pub mod driver;
pub mod error;
pub mod firmware;
pub mod mirror;
pub mod reader;
pub mod session;
pub mod target;
pub mod transmit;
pub mod waiter;

// Re-exports for convenience
pub use {
    cancel::CancelToken,
    driver::{Failure, NullReporter, ProtocolDriver, Reporter, Step, Verdict},
    error::{Error, Result},
    firmware::{
        ArtifactBuilder, FirmwareBuilder, FirmwareImage, ImageOrigin, MakeTarget, crc32,
    },
    mirror::{MirrorSink, UartMirror, UartSanitizer},
    reader::{ByteStreamReader, UartEvent, UartSink},
    session::{MirrorConfig, ProtocolSession, ProtocolTimeouts, SessionConfig},
    target::{
        ChildProcess, LaunchConfig, Launcher, QemuLauncher, TargetLink, TargetProcess,
        find_emulator,
    },
    transmit::ByteTransmitter,
    waiter::{NoProgress, PatternWaiter, ProgressSink, WaitOutcome, WaitStatus},
};

//! bootcheck CLI - validate a bootloader's UART update protocol under QEMU.
//!
//! ## Features
//!
//! - Launch the emulated bootloader and drive the full update handshake
//! - Upload a prebuilt or synthesized test application
//! - Mirror sanitized UART output to a file for live tailing
//! - Configuration file and environment variable support
//! - Machine-readable verdict with `--json`
//! - Shell completion generation

use anyhow::{Context, Result};
use bootcheck::session::secs_to_duration;
use bootcheck::{
    CancelToken, FirmwareBuilder, LaunchConfig, MakeTarget, ProtocolDriver, QemuLauncher,
    SessionConfig, Verdict,
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use log::debug;
use serde_json::json;
use std::env;
use std::io;
use std::path::PathBuf;

mod config;
mod report;

use config::Config;
use report::ConsoleReporter;

/// bootcheck - UART boot/update protocol validator for emulated targets.
///
/// Environment variables:
///   BOOTCHECK_UART_MIRROR_FILE  - Mirror file path
///   BOOTCHECK_UART_LIVE_ONLY    - Delete the mirror file on exit
///   BOOTCHECK_DEMO_STEP_DELAY   - Pause before key steps (seconds)
///   BOOTCHECK_DEMO_BYTE_DELAY   - Delay between firmware bytes (seconds)
///   BOOTCHECK_EMULATOR          - Emulator binary
///   BOOTCHECK_KERNEL            - Bootloader image
///   BOOTCHECK_FIRMWARE          - Test application artifact
#[derive(Parser, Debug)]
#[command(name = "bootcheck")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Mirror printable UART output to a file for live tailing in another terminal.
    #[arg(long, value_name = "PATH", env = "BOOTCHECK_UART_MIRROR_FILE")]
    uart_mirror_file: Option<PathBuf>,

    /// Delete the UART mirror file when the run ends.
    #[arg(long, env = "BOOTCHECK_UART_LIVE_ONLY")]
    uart_live_only: bool,

    /// Pause before key protocol steps, in seconds (for narrated demos).
    #[arg(
        long,
        value_name = "SECS",
        allow_negative_numbers = true,
        env = "BOOTCHECK_DEMO_STEP_DELAY"
    )]
    demo_step_delay: Option<f64>,

    /// Delay between firmware bytes, in seconds.
    #[arg(
        long,
        value_name = "SECS",
        allow_negative_numbers = true,
        env = "BOOTCHECK_DEMO_BYTE_DELAY"
    )]
    demo_byte_delay: Option<f64>,

    /// Emulator binary (searched on PATH if not specified).
    #[arg(long, value_name = "PATH", env = "BOOTCHECK_EMULATOR")]
    emulator: Option<PathBuf>,

    /// Bootloader image passed to the emulator.
    #[arg(long, value_name = "PATH", env = "BOOTCHECK_KERNEL")]
    kernel: Option<PathBuf>,

    /// Prebuilt test application.
    #[arg(long, value_name = "PATH", env = "BOOTCHECK_FIRMWARE")]
    firmware: Option<PathBuf>,

    /// Firmware size hint in bytes.
    #[arg(long, value_name = "BYTES", env = "BOOTCHECK_FIRMWARE_SIZE")]
    firmware_size: Option<usize>,

    /// Do not run `make test-app` when the artifact is missing.
    #[arg(long)]
    no_build: bool,

    /// Do not kill leftover emulator instances before launching.
    #[arg(long, env = "BOOTCHECK_NO_SWEEP")]
    no_sweep: bool,

    /// Print the verdict as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only failures are printed).
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands. Without one, the protocol run starts.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }
    let fancy = stderr_is_tty && console::colors_enabled_stderr();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "bootcheck v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Some(Commands::Completions { shell }) = cli.command {
        cmd_completions(shell);
        return Ok(());
    }

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let code = cmd_run(&cli, &config, fancy)?;
    std::process::exit(code);
}

/// Run the protocol once and report the verdict. Returns the exit code.
fn cmd_run(cli: &Cli, config: &Config, fancy: bool) -> Result<i32> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let driver = ProtocolDriver::new(
        QemuLauncher::new(launch_config(cli, config)),
        firmware_builder(cli, config),
        session_config(cli, config),
    )
    .with_cancel(cancel);

    if !cli.quiet {
        eprintln!(
            "\n{}",
            style("RISC-V Bootloader Validation Test").bold()
        );
    }

    let mut reporter = ConsoleReporter::new(cli.quiet, fancy);
    let verdict = driver.run(&mut reporter);

    match &verdict {
        Verdict::Pass if !cli.quiet => {
            eprintln!("\n{}\n", style("✓ ALL TESTS PASSED").green().bold());
        },
        Verdict::Pass => {},
        Verdict::Fail(failure) => {
            eprintln!(
                "\n{} step {}/{}: {}\n",
                style("✗ FAILED").red().bold(),
                failure.step.number(),
                bootcheck::Step::TOTAL,
                failure.error
            );
        },
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&verdict_json(&verdict))?);
    }

    Ok(verdict.exit_code())
}

fn verdict_json(verdict: &Verdict) -> serde_json::Value {
    match verdict {
        Verdict::Pass => json!({
            "passed": true,
            "step": null,
            "reason": null,
            "captured": null,
        }),
        Verdict::Fail(failure) => json!({
            "passed": false,
            "step": failure.step.id(),
            "step_number": failure.step.number(),
            "reason": failure.reason,
            "error": failure.error.to_string(),
            "captured": failure.captured(),
        }),
    }
}

fn launch_config(cli: &Cli, config: &Config) -> LaunchConfig {
    let mut launch = LaunchConfig {
        emulator: cli.emulator.clone().or_else(|| config.emulator.path.clone()),
        sweep: !cli.no_sweep && config.emulator.sweep != Some(false),
        ..LaunchConfig::default()
    };
    if let Some(kernel) = cli.kernel.clone().or_else(|| config.emulator.kernel.clone()) {
        launch.kernel = kernel;
    }
    if let Some(machine) = &config.emulator.machine {
        launch.machine.clone_from(machine);
    }
    launch
}

fn firmware_builder(cli: &Cli, config: &Config) -> FirmwareBuilder {
    let artifact = cli
        .firmware
        .clone()
        .or_else(|| config.firmware.artifact.clone())
        .unwrap_or_else(|| PathBuf::from(bootcheck::firmware::DEFAULT_ARTIFACT));

    let builder = FirmwareBuilder::new(artifact);
    if cli.no_build || config.firmware.build == Some(false) {
        builder
    } else {
        builder.with_build_step(Box::new(MakeTarget::default()))
    }
}

fn session_config(cli: &Cli, config: &Config) -> SessionConfig {
    let mut session = SessionConfig {
        firmware_size: cli.firmware_size.or(config.firmware.size),
        timeouts: config.timeouts.apply(Default::default()),
        ..SessionConfig::default()
    };

    if let Some(secs) = cli.demo_step_delay.or(config.pacing.step_delay) {
        session.step_delay = secs_to_duration(secs);
    }
    if let Some(secs) = cli.demo_byte_delay.or(config.pacing.byte_delay) {
        session.byte_delay = secs_to_duration(secs);
    }

    let mirror = cli
        .uart_mirror_file
        .clone()
        .or_else(|| config.uart.mirror_file.clone());
    if let Some(path) = mirror {
        session = session.with_mirror(path, cli.uart_live_only || config.uart.live_only);
    }
    session
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

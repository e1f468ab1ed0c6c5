//! Emulated target processes.
//!
//! The UART of the emulated board is the emulator's stdio: stdin carries host
//! to device bytes, stdout and stderr share one pipe for device to host bytes.
//!
//! [`Launcher`] is the seam between the protocol driver and whatever runs the
//! device; [`QemuLauncher`] is the real implementation.

use log::{debug, trace, warn};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default emulator executable name.
pub const EMULATOR_NAME: &str = "qemu-system-riscv32";

/// Default bootloader image passed to the emulator.
pub const DEFAULT_KERNEL: &str = "bootloader.elf";

/// Default emulated machine profile.
pub const DEFAULT_MACHINE: &str = "virt";

/// Time allowed for a graceful exit before the process is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Where Windows installers usually put QEMU.
#[cfg(windows)]
const WINDOWS_INSTALL_DIRS: &[&str] = &[
    r"C:\Program Files\qemu",
    r"C:\Program Files (x86)\qemu",
    r"C:\qemu",
];

/// A running target that can be stopped.
pub trait TargetProcess: Send {
    /// OS process id, if any.
    fn id(&self) -> Option<u32>;

    /// Stop the target: ask politely, wait up to `grace`, then force.
    fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// The UART endpoints and process handle of a launched target.
pub struct TargetLink {
    /// Device to host bytes.
    pub output: Box<dyn Read + Send>,
    /// Host to device bytes.
    pub input: Box<dyn Write + Send>,
    /// Process handle used for cleanup.
    pub process: Box<dyn TargetProcess>,
}

impl fmt::Debug for TargetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetLink")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Starts targets for protocol sessions.
pub trait Launcher {
    /// Remove leftovers of earlier aborted runs. Errors are ignored.
    fn sweep(&self) {}

    /// Start the target with its UART connected.
    fn launch(&self) -> Result<TargetLink>;
}

/// Emulator invocation settings.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Explicit emulator path; searched on `PATH` when `None`.
    pub emulator: Option<PathBuf>,
    /// Executable name used for `PATH` search and the stale-process sweep.
    pub program_name: String,
    /// Kill leftover instances of `program_name` before launching.
    pub sweep: bool,
    /// Machine profile (`-M`).
    pub machine: String,
    /// Bootloader image (`-kernel`).
    pub kernel: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            emulator: None,
            program_name: EMULATOR_NAME.to_string(),
            sweep: true,
            machine: DEFAULT_MACHINE.to_string(),
            kernel: PathBuf::from(DEFAULT_KERNEL),
        }
    }
}

impl LaunchConfig {
    /// Emulator arguments: no display, serial on stdio, no BIOS, bootloader as
    /// kernel. The application firmware is never preloaded.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-M",
            self.machine.as_str(),
            "-display",
            "none",
            "-serial",
            "stdio",
            "-bios",
            "none",
            "-kernel",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(self.kernel.clone().into_os_string());
        args
    }
}

/// Locate `name` on `PATH` (plus well-known install directories on Windows).
pub fn find_emulator(name: &str) -> Option<PathBuf> {
    let exe = format!("{name}{}", env::consts::EXE_SUFFIX);

    let on_path = env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(&exe))
            .find(|candidate| candidate.is_file())
    });
    if on_path.is_some() {
        return on_path;
    }

    #[cfg(windows)]
    {
        for dir in WINDOWS_INSTALL_DIRS {
            let candidate = Path::new(dir).join(&exe);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

/// Kill every process whose executable is named `name`. Best effort; failures
/// are only logged.
///
/// `pkill` matches the kernel's 15-character `comm` name by default, which is
/// too short for `qemu-system-riscv32`, so the match runs on the full command
/// line, anchored to its first word.
pub fn kill_stale_instances(name: &str) {
    let result = if cfg!(windows) {
        Command::new("taskkill")
            .args(["/F", "/IM", &format!("{name}.exe")])
            .output()
    } else {
        Command::new("pkill")
            .args(["-9", "-f", &command_line_pattern(name)])
            .output()
    };

    match result {
        Ok(output) if output.status.success() => debug!("Killed stale {name} instances"),
        // pkill exits with 1, taskkill with 128, when nothing matched.
        Ok(output) if matches!(output.status.code(), Some(1 | 128)) => {
            trace!("No stale {name} instances");
        },
        Ok(output) => warn!(
            "Stale {name} sweep failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("Stale {name} sweep unavailable: {e}"),
    }
}

/// Extended regex matching command lines whose program is `name`, invoked by
/// bare name or by path.
fn command_line_pattern(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("^([^ ]*/)?{escaped}( |$)")
}

/// Launches QEMU with the board UART on stdio.
#[derive(Debug, Clone, Default)]
pub struct QemuLauncher {
    config: LaunchConfig,
}

impl QemuLauncher {
    /// Launcher with the given settings.
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    fn resolve(&self) -> Result<PathBuf> {
        match &self.config.emulator {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(Error::Environment(format!(
                "emulator not found at {}",
                path.display()
            ))),
            None => find_emulator(&self.config.program_name).ok_or_else(|| {
                Error::Environment(format!(
                    "{} not found. Install QEMU or add it to PATH.",
                    self.config.program_name
                ))
            }),
        }
    }
}

impl Launcher for QemuLauncher {
    fn sweep(&self) {
        if self.config.sweep {
            kill_stale_instances(&self.config.program_name);
        } else {
            debug!("Stale {} sweep disabled", self.config.program_name);
        }
    }

    fn launch(&self) -> Result<TargetLink> {
        let program = self.resolve()?;
        debug!("Launching {} {:?}", program.display(), self.config.args());

        let (output, writer) = io::pipe()?;
        let mut child = {
            // The command owns the write ends; it must drop before reading, or the
            // pipe never reports end-of-stream.
            let mut cmd = Command::new(&program);
            cmd.args(self.config.args())
                .stdin(Stdio::piped())
                .stdout(writer.try_clone()?)
                .stderr(writer);
            cmd.spawn().map_err(|e| spawn_error(&program, e))?
        };

        let Some(input) = child.stdin.take() else {
            let mut process = ChildProcess::new(child);
            let _ = process.terminate(TERMINATE_GRACE);
            return Err(Error::Environment("emulator stdin unavailable".into()));
        };

        Ok(TargetLink {
            output: Box::new(output),
            input: Box::new(input),
            process: Box::new(ChildProcess::new(child)),
        })
    }
}

fn spawn_error(program: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::Environment(format!("emulator not found at {}", program.display()))
    } else {
        Error::Environment(format!("cannot start {}: {e}", program.display()))
    }
}

/// [`TargetProcess`] backed by an OS child process.
///
/// Dropping it kills the process if it is still running.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    /// Take ownership of a spawned child.
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    #[cfg(unix)]
    fn request_exit(&mut self) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.child.id()) else {
            let _ = self.child.kill();
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!("SIGTERM to pid {raw} failed: {e}");
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) {
        let _ = self.child.kill();
    }
}

impl TargetProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        debug!("Terminating target (pid {})", self.child.id());
        self.request_exit();

        let start = Instant::now();
        while start.elapsed() < grace {
            if self.has_exited() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(20));
        }

        warn!("Target did not exit within {grace:?}, killing");
        match self.child.kill() {
            Ok(()) => {},
            // Already reaped between the last poll and kill().
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {},
            Err(e) => return Err(e.into()),
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = LaunchConfig::default().args();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-M",
                "virt",
                "-display",
                "none",
                "-serial",
                "stdio",
                "-bios",
                "none",
                "-kernel",
                "bootloader.elf"
            ]
        );
    }

    #[test]
    fn test_missing_explicit_emulator_is_environment_error() {
        let launcher = QemuLauncher::new(LaunchConfig {
            emulator: Some(PathBuf::from("/nonexistent/bootcheck/qemu-system-riscv32")),
            ..LaunchConfig::default()
        });
        assert!(matches!(launcher.launch(), Err(Error::Environment(_))));
    }

    #[test]
    fn test_unknown_program_not_on_path() {
        assert!(find_emulator("bootcheck-no-such-emulator-4f1c").is_none());

        let launcher = QemuLauncher::new(LaunchConfig {
            program_name: "bootcheck-no-such-emulator-4f1c".into(),
            ..LaunchConfig::default()
        });
        match launcher.launch() {
            Err(Error::Environment(msg)) => assert!(msg.contains("not found")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_sweep_of_unknown_name_is_harmless() {
        kill_stale_instances("bootcheck-no-such-emulator-4f1c");
    }

    #[test]
    fn test_command_line_pattern_anchors_program() {
        assert_eq!(
            command_line_pattern("qemu-system-riscv32"),
            "^([^ ]*/)?qemu-system-riscv32( |$)"
        );
        assert_eq!(command_line_pattern("a.b+c"), r"^([^ ]*/)?a\.b\+c( |$)");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sweep_kills_process_with_long_name() {
        // Longer than the 15-character comm name, like the real emulator.
        let name = format!("bootcheck-sweep-{}-riscv32", std::process::id());
        assert!(name.len() > 15);

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join(&name);
        std::fs::copy("/bin/sleep", &exe).unwrap();

        let child = Command::new(&exe).arg("30").spawn().unwrap();
        let mut process = ChildProcess::new(child);

        let disabled = QemuLauncher::new(LaunchConfig {
            program_name: name.clone(),
            sweep: false,
            ..LaunchConfig::default()
        });
        disabled.sweep();
        thread::sleep(Duration::from_millis(100));
        assert!(!process.has_exited());

        kill_stale_instances(&name);

        let start = Instant::now();
        while !process.has_exited() && start.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_stops_running_child_with_sigterm() {
        use std::os::unix::process::ExitStatusExt;

        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("sleep should spawn");
        let mut process = ChildProcess::new(child);

        let start = Instant::now();
        process
            .terminate(Duration::from_secs(2))
            .unwrap();
        // Well inside the grace period, so the forced kill never ran.
        assert!(start.elapsed() < Duration::from_secs(1));
        let status = process.child.wait().unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGTERM as i32));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_after_exit_is_noop() {
        let child = Command::new("true")
            .spawn()
            .expect("true should spawn");
        let mut process = ChildProcess::new(child);
        thread::sleep(Duration::from_millis(200));
        process
            .terminate(Duration::from_millis(100))
            .unwrap();
    }
}

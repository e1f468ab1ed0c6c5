//! Configuration file support for bootcheck.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOOTCHECK_*)
//! 3. Local config file (./bootcheck.toml)
//! 4. Global config file (~/.config/bootcheck/config.toml)

use bootcheck::ProtocolTimeouts;
use bootcheck::session::secs_to_duration;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "bootcheck.toml";

/// Emulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Explicit emulator binary.
    pub path: Option<PathBuf>,
    /// Bootloader image passed as `-kernel`.
    pub kernel: Option<PathBuf>,
    /// Machine profile passed as `-M`.
    pub machine: Option<String>,
    /// Kill leftover emulator instances before launching.
    pub sweep: Option<bool>,
}

/// Firmware configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Prebuilt artifact path.
    pub artifact: Option<PathBuf>,
    /// Size hint in bytes.
    pub size: Option<usize>,
    /// Run `make test-app` when the artifact is missing.
    pub build: Option<bool>,
}

/// UART mirror configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UartConfig {
    /// Mirror file path.
    pub mirror_file: Option<PathBuf>,
    /// Delete the mirror file on exit.
    #[serde(default)]
    pub live_only: bool,
}

/// Pacing configuration, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Pause before key protocol steps.
    pub step_delay: Option<f64>,
    /// Delay between firmware bytes.
    pub byte_delay: Option<f64>,
}

/// Per-wait timeout overrides, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// `BOOT?`.
    pub boot: Option<f64>,
    /// `OK` after `u`.
    pub update_ack: Option<f64>,
    /// `READY`.
    pub ready: Option<f64>,
    /// `CRC?`.
    pub crc: Option<f64>,
    /// `OK` after `CRC?`.
    pub crc_ok: Option<f64>,
    /// `REBOOT`.
    pub reboot: Option<f64>,
    /// `APP_BOOT`.
    pub app_boot: Option<f64>,
    /// `App:`.
    pub app_heartbeat: Option<f64>,
}

impl TimeoutConfig {
    /// Apply the overrides on top of `base`.
    pub fn apply(&self, mut base: ProtocolTimeouts) -> ProtocolTimeouts {
        let set = |slot: &mut std::time::Duration, secs: Option<f64>| {
            if let Some(secs) = secs {
                *slot = secs_to_duration(secs);
            }
        };
        set(&mut base.boot_prompt, self.boot);
        set(&mut base.update_ack, self.update_ack);
        set(&mut base.flash_ready, self.ready);
        set(&mut base.crc_prompt, self.crc);
        set(&mut base.crc_ok, self.crc_ok);
        set(&mut base.reboot, self.reboot);
        set(&mut base.app_boot, self.app_boot);
        set(&mut base.app_heartbeat, self.app_heartbeat);
        base
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Emulator configuration.
    #[serde(default)]
    pub emulator: EmulatorConfig,
    /// Firmware configuration.
    #[serde(default)]
    pub firmware: FirmwareConfig,
    /// UART mirror configuration.
    #[serde(default)]
    pub uart: UartConfig,
    /// Pacing configuration.
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bootcheck").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.emulator.path, other.emulator.path);
        take(&mut self.emulator.kernel, other.emulator.kernel);
        take(&mut self.emulator.machine, other.emulator.machine);
        take(&mut self.emulator.sweep, other.emulator.sweep);

        take(&mut self.firmware.artifact, other.firmware.artifact);
        take(&mut self.firmware.size, other.firmware.size);
        take(&mut self.firmware.build, other.firmware.build);

        take(&mut self.uart.mirror_file, other.uart.mirror_file);
        if other.uart.live_only {
            self.uart.live_only = true;
        }

        take(&mut self.pacing.step_delay, other.pacing.step_delay);
        take(&mut self.pacing.byte_delay, other.pacing.byte_delay);

        let t = other.timeouts;
        take(&mut self.timeouts.boot, t.boot);
        take(&mut self.timeouts.update_ack, t.update_ack);
        take(&mut self.timeouts.ready, t.ready);
        take(&mut self.timeouts.crc, t.crc);
        take(&mut self.timeouts.crc_ok, t.crc_ok);
        take(&mut self.timeouts.reboot, t.reboot);
        take(&mut self.timeouts.app_boot, t.app_boot);
        take(&mut self.timeouts.app_heartbeat, t.app_heartbeat);
    }
}

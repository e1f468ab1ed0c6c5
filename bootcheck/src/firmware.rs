//! Firmware images for the upload step.
//!
//! An image comes from a prebuilt artifact when one exists (optionally produced
//! by an external build step first), otherwise it is synthesized as a repeating
//! `0x00..=0xFF` pattern so that size and checksum are reproducible without a
//! cross toolchain.

use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// Size of a synthesized image when no size hint is given.
pub const DEFAULT_FIRMWARE_SIZE: usize = 1024;

/// Default location of the prebuilt test application.
pub const DEFAULT_ARTIFACT: &str = "test_app.bin";

/// Standard CRC-32 (IEEE 802.3) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Where an image came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Loaded from an artifact on disk.
    Artifact(PathBuf),
    /// Generated filler pattern.
    Synthesized,
}

impl fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact(path) => write!(f, "{}", path.display()),
            Self::Synthesized => write!(f, "synthesized pattern"),
        }
    }
}

/// An immutable firmware payload with its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    crc32: u32,
    origin: ImageOrigin,
}

impl FirmwareImage {
    /// Wrap raw bytes, computing the checksum.
    pub fn from_bytes(bytes: Vec<u8>, origin: ImageOrigin) -> Self {
        let crc32 = crc32(&bytes);
        Self {
            bytes,
            crc32,
            origin,
        }
    }

    /// Deterministic filler image of exactly `size` bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn synthesize(size: usize) -> Self {
        // Truncation is the point: the pattern cycles through 0..=255.
        let bytes = (0..size)
            .map(|i| i as u8)
            .collect();
        Self::from_bytes(bytes, ImageOrigin::Synthesized)
    }

    /// Payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// CRC-32 over [`bytes`](Self::bytes).
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Where the payload came from.
    pub fn origin(&self) -> &ImageOrigin {
        &self.origin
    }
}

/// External step that may produce the firmware artifact.
pub trait ArtifactBuilder {
    /// Try to build the artifact. Returns `true` if the step reported success.
    fn build(&self) -> bool;
}

/// Runs `make <target>` in the current directory.
#[derive(Debug, Clone)]
pub struct MakeTarget {
    program: String,
    target: String,
}

impl MakeTarget {
    /// `make <target>`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            program: "make".to_string(),
            target: target.into(),
        }
    }

    /// Use a different `make` executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for MakeTarget {
    fn default() -> Self {
        Self::new("test-app")
    }
}

impl ArtifactBuilder for MakeTarget {
    fn build(&self) -> bool {
        debug!("Running {} {}", self.program, self.target);
        match Command::new(&self.program)
            .arg(&self.target)
            .output()
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                debug!(
                    "{} {} exited with {}: {}",
                    self.program,
                    self.target,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            },
            Err(e) => {
                debug!("Could not run {}: {e}", self.program);
                false
            },
        }
    }
}

/// Produces the image for a run.
pub struct FirmwareBuilder {
    artifact: PathBuf,
    build_step: Option<Box<dyn ArtifactBuilder>>,
}

impl fmt::Debug for FirmwareBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareBuilder")
            .field("artifact", &self.artifact)
            .field("build_step", &self.build_step.is_some())
            .finish()
    }
}

impl Default for FirmwareBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ARTIFACT).with_build_step(Box::new(MakeTarget::default()))
    }
}

impl FirmwareBuilder {
    /// Builder looking for `artifact`, with no build step.
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            build_step: None,
        }
    }

    /// Run `step` when the artifact is missing.
    #[must_use]
    pub fn with_build_step(mut self, step: Box<dyn ArtifactBuilder>) -> Self {
        self.build_step = Some(step);
        self
    }

    /// Artifact path this builder looks for.
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Produce the image.
    ///
    /// - An existing artifact is loaded and truncated to `size_hint` if longer;
    ///   it is never padded.
    /// - A missing artifact triggers the build step (if any), then a re-check.
    /// - Otherwise a pattern of `size_hint` (or the default size) is synthesized.
    pub fn produce(&self, size_hint: Option<usize>) -> Result<FirmwareImage> {
        if !self.artifact.exists() {
            if let Some(step) = &self.build_step {
                info!("Firmware artifact {} missing, building", self.artifact.display());
                if !step.build() {
                    warn!("Firmware build step failed");
                }
            }
        }

        if self.artifact.exists() {
            return self.load(size_hint);
        }

        let size = size_hint.unwrap_or(DEFAULT_FIRMWARE_SIZE);
        debug!("Synthesizing {size}-byte firmware");
        Ok(FirmwareImage::synthesize(size))
    }

    fn load(&self, size_hint: Option<usize>) -> Result<FirmwareImage> {
        let mut bytes = fs::read(&self.artifact).map_err(|e| {
            Error::Firmware(format!("cannot read {}: {e}", self.artifact.display()))
        })?;

        if let Some(limit) = size_hint {
            if bytes.len() > limit {
                debug!("Truncating artifact from {} to {limit} bytes", bytes.len());
                bytes.truncate(limit);
            }
        }

        Ok(FirmwareImage::from_bytes(
            bytes,
            ImageOrigin::Artifact(self.artifact.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::tempdir;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_synthesize_pattern_and_size() {
        let image = FirmwareImage::synthesize(600);
        assert_eq!(image.len(), 600);
        assert_eq!(image.bytes()[0], 0);
        assert_eq!(image.bytes()[255], 255);
        assert_eq!(image.bytes()[256], 0);
        assert_eq!(image.bytes()[599], (599 % 256) as u8);
        assert_eq!(image.origin(), &ImageOrigin::Synthesized);
    }

    #[test]
    fn test_synthesize_is_idempotent() {
        let a = FirmwareImage::synthesize(1024);
        let b = FirmwareImage::synthesize(1024);
        assert_eq!(a, b);
        assert_eq!(a.crc32(), crc32(a.bytes()));
    }

    #[test]
    fn test_missing_artifact_synthesizes_default() {
        let dir = tempdir().unwrap();
        let builder = FirmwareBuilder::new(dir.path().join("none.bin"));

        let image = builder.produce(None).unwrap();
        assert_eq!(image.len(), DEFAULT_FIRMWARE_SIZE);
        assert_eq!(image, FirmwareImage::synthesize(DEFAULT_FIRMWARE_SIZE));

        let hinted = builder.produce(Some(300)).unwrap();
        assert_eq!(hinted.len(), 300);
    }

    #[test]
    fn test_artifact_truncated_to_hint_with_matching_crc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.bin");
        let content: Vec<u8> = (0..500u32).map(|i| (i * 7 % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let builder = FirmwareBuilder::new(&path);
        for size in [0, 1, 64, 499, 500] {
            let image = builder.produce(Some(size)).unwrap();
            assert_eq!(image.bytes(), &content[..size]);
            assert_eq!(image.crc32(), crc32(&content[..size]));
        }
    }

    #[test]
    fn test_artifact_never_padded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();

        let image = FirmwareBuilder::new(&path)
            .produce(Some(1024))
            .unwrap();
        assert_eq!(image.bytes(), &[1, 2, 3]);
        assert_eq!(image.origin(), &ImageOrigin::Artifact(path));
    }

    struct WritingStep {
        path: PathBuf,
        runs: Rc<Cell<usize>>,
    }

    impl ArtifactBuilder for WritingStep {
        fn build(&self) -> bool {
            self.runs.set(self.runs.get() + 1);
            fs::write(&self.path, b"built").is_ok()
        }
    }

    #[test]
    fn test_build_step_runs_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("built.bin");
        let runs = Rc::new(Cell::new(0));
        let builder = FirmwareBuilder::new(&path).with_build_step(Box::new(WritingStep {
            path: path.clone(),
            runs: Rc::clone(&runs),
        }));

        let image = builder.produce(None).unwrap();
        assert_eq!(image.bytes(), b"built");
        assert_eq!(runs.get(), 1);

        // Artifact now exists; no rebuild.
        builder.produce(None).unwrap();
        assert_eq!(runs.get(), 1);
    }

    struct FailingStep;

    impl ArtifactBuilder for FailingStep {
        fn build(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_failed_build_falls_back_to_synthesis() {
        let dir = tempdir().unwrap();
        let builder =
            FirmwareBuilder::new(dir.path().join("x.bin")).with_build_step(Box::new(FailingStep));
        let image = builder.produce(Some(64)).unwrap();
        assert_eq!(image, FirmwareImage::synthesize(64));
    }

    #[test]
    fn test_make_target_with_missing_program_fails_cleanly() {
        let step = MakeTarget::new("test-app").with_program("definitely-not-a-make-binary-xyz");
        assert!(!step.build());
    }

    #[test]
    fn test_unreadable_artifact_is_firmware_error() {
        let dir = tempdir().unwrap();
        // A directory exists but cannot be read as a file.
        let err = FirmwareBuilder::new(dir.path())
            .produce(None)
            .unwrap_err();
        assert!(matches!(err, Error::Firmware(_)));
    }
}

//! Startup checks module for compressd
//!
//! Preflight checks run before the daemon touches the job table:
//! - the transcoder resolves and `-version` runs (major version is logged)
//! - a configured hardware encoder is listed by `-encoders`
//! - the input directory exists and the output directory is created

use crate::config::{Config, HwAccel};
use crate::encode::{resolve_executable, video_encoder_name};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Encoder {encoder} not supported by {ffmpeg}")]
    EncoderUnavailable { encoder: String, ffmpeg: PathBuf },

    #[error("Input directory {0} does not exist or is not a directory")]
    InputDirMissing(PathBuf),

    #[error("Cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Whether an `ffmpeg -encoders` listing contains `encoder`.
///
/// Listing rows look like ` V....D hevc_qsv    HEVC (Intel Quick Sync Video)`;
/// the encoder name is the second column.
pub fn encoders_list_contains(listing: &str, encoder: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

fn run_ffmpeg(ffmpeg: &Path, args: &[&str]) -> Result<String, StartupError> {
    let output = Command::new(ffmpeg).args(args).output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "{} {} failed to run: {}",
            ffmpeg.display(),
            args.join(" "),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} {} exited with {}",
            ffmpeg.display(),
            args.join(" "),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that the transcoder resolves and answers `-version`.
///
/// Returns the resolved executable and its major version when parseable.
pub fn check_ffmpeg_available(ffmpeg: &Path) -> Result<(PathBuf, Option<u32>), StartupError> {
    let exe = resolve_executable(ffmpeg).map_err(|e| {
        StartupError::FfmpegUnavailable(format!("{}; is ffmpeg installed and in PATH?", e))
    })?;

    let version_output = run_ffmpeg(&exe, &["-version"])?;
    let major = parse_ffmpeg_version(&version_output);
    match major {
        Some(major) => info!(ffmpeg = %exe.display(), major, "ffmpeg found"),
        None => warn!(
            ffmpeg = %exe.display(),
            first_line = version_output.lines().next().unwrap_or("(empty)"),
            "could not parse ffmpeg version"
        ),
    }
    Ok((exe, major))
}

/// Check that the selected hardware encoder is compiled into the transcoder.
///
/// Software encodes are not checked.
pub fn check_encoder_available(ffmpeg: &Path, cfg: &Config) -> Result<(), StartupError> {
    if cfg.encode.hw_accel == HwAccel::None {
        return Ok(());
    }

    let encoder = video_encoder_name(cfg.encode.codec, cfg.encode.hw_accel);
    let listing = run_ffmpeg(ffmpeg, &["-hide_banner", "-encoders"])?;
    if !encoders_list_contains(&listing, encoder) {
        return Err(StartupError::EncoderUnavailable {
            encoder: encoder.to_string(),
            ffmpeg: ffmpeg.to_path_buf(),
        });
    }
    info!(encoder, "hardware encoder available");
    Ok(())
}

/// Check the input directory exists and create the output directory.
pub fn prepare_directories(cfg: &Config) -> Result<(), StartupError> {
    let input = &cfg.paths.input_dir;
    if !input.is_dir() {
        return Err(StartupError::InputDirMissing(input.clone()));
    }

    let output = &cfg.paths.output_dir;
    std::fs::create_dir_all(output).map_err(|source| StartupError::OutputDir {
        path: output.clone(),
        source,
    })?;
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Directories
/// 2. FFmpeg availability and version
/// 3. Hardware encoder availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    prepare_directories(cfg)?;
    let (exe, _) = check_ffmpeg_available(&cfg.paths.ffmpeg_path)?;
    check_encoder_available(&exe, cfg)?;
    Ok(())
}

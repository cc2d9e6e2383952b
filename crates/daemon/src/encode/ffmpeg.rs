//! ffmpeg argument construction and output naming.
//!
//! Everything here is pure apart from [`archive_existing_output`]; the same
//! policy and paths always produce the same argument vector.

use chrono::{DateTime, Local};
use compressd_config::{Codec, EncodeConfig, HwAccel, QualityTier};
use std::io;
use std::path::{Path, PathBuf};

/// Leading flags: quiet banner, overwrite, errors only, progress stats.
const GLOBAL_ARGS: &[&str] = &["-hide_banner", "-y", "-loglevel", "error", "-stats"];

/// Mono AAC at 32 kb/s, 22.05 kHz, constant bitrate.
const AUDIO_ARGS: &[&str] = &[
    "-c:a", "aac", "-b:a", "32k", "-ar", "22050", "-ac", "1", "-vbr", "0",
];

/// Prefix for compressed output names.
pub const OUTPUT_PREFIX: &str = "compressed_";

/// Parameters for one ffmpeg encode.
#[derive(Debug, Clone)]
pub struct FfmpegEncodeParams {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub policy: EncodeConfig,
}

impl FfmpegEncodeParams {
    pub fn new(input_path: PathBuf, output_path: PathBuf, policy: EncodeConfig) -> Self {
        Self {
            input_path,
            output_path,
            policy,
        }
    }
}

/// ffmpeg encoder for a codec and hardware path.
pub fn video_encoder_name(codec: Codec, hw_accel: HwAccel) -> &'static str {
    match (codec, hw_accel) {
        (Codec::H264, HwAccel::Qsv) => "h264_qsv",
        (Codec::H264, HwAccel::Nvenc) => "h264_nvenc",
        (Codec::H264, HwAccel::None) => "libx264",
        (Codec::H265, HwAccel::Qsv) => "hevc_qsv",
        (Codec::H265, HwAccel::Nvenc) => "hevc_nvenc",
        (Codec::H265, HwAccel::None) => "libx265",
    }
}

/// Decode-side acceleration flags, placed before `-i`.
fn hwaccel_args(hw_accel: HwAccel) -> &'static [&'static str] {
    match hw_accel {
        HwAccel::Qsv => &["-hwaccel", "qsv", "-hwaccel_output_format", "qsv"],
        HwAccel::Nvenc => &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"],
        HwAccel::None => &[],
    }
}

/// Rate-control flags for a hardware path and quality tier.
pub fn quality_args(hw_accel: HwAccel, quality: QualityTier) -> [&'static str; 4] {
    let level = match quality {
        QualityTier::High => "20",
        QualityTier::Medium => "28",
        QualityTier::Low => "35",
    };
    match hw_accel {
        HwAccel::Qsv => {
            let preset = if quality == QualityTier::High { "veryfast" } else { "7" };
            ["-global_quality", level, "-preset", preset]
        }
        HwAccel::Nvenc => ["-cq", level, "-preset", "p1"],
        HwAccel::None => ["-crf", level, "-preset", "veryfast"],
    }
}

/// Build the full ffmpeg argument vector for an encode.
pub fn build_ffmpeg_args(params: &FfmpegEncodeParams) -> Vec<String> {
    let EncodeConfig {
        codec,
        hw_accel,
        quality,
        ..
    } = params.policy;

    let mut args: Vec<String> = GLOBAL_ARGS.iter().map(|s| s.to_string()).collect();
    args.extend(hwaccel_args(hw_accel).iter().map(|s| s.to_string()));

    args.push("-i".to_string());
    args.push(params.input_path.to_string_lossy().into_owned());

    args.push("-c:v".to_string());
    args.push(video_encoder_name(codec, hw_accel).to_string());
    args.extend(quality_args(hw_accel, quality).iter().map(|s| s.to_string()));

    args.extend(AUDIO_ARGS.iter().map(|s| s.to_string()));
    args.push(params.output_path.to_string_lossy().into_owned());
    args
}

/// `<output_dir>/compressed_<stem>.mp4` for a source file.
pub fn output_path_for(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_dir.join(format!("{OUTPUT_PREFIX}{stem}.mp4"))
}

/// Name an existing output is moved to: `<yyyy-MM-dd-HH-mm-ss-fff>_<name>`.
pub fn archived_path(output: &Path, now: DateTime<Local>) -> PathBuf {
    let name = output
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = now.format("%Y-%m-%d-%H-%M-%S-%3f");
    output.with_file_name(format!("{stamp}_{name}"))
}

/// Move an existing file at `output` aside so the encode never overwrites it.
///
/// Returns where it went, or `None` if nothing was there.
pub fn archive_existing_output(output: &Path) -> io::Result<Option<PathBuf>> {
    if !output.exists() {
        return Ok(None);
    }
    let target = archived_path(output, Local::now());
    std::fs::rename(output, &target)?;
    Ok(Some(target))
}

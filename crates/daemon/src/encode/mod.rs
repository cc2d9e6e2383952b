//! Encoding modules for compressd

pub mod ffmpeg;
pub mod runner;

pub use ffmpeg::{
    archive_existing_output, build_ffmpeg_args, output_path_for, video_encoder_name,
    FfmpegEncodeParams,
};
pub use runner::{resolve_executable, run_process, ProcessOutput, RunError};

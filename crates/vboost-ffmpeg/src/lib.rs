#![doc = include_str!("../README.md")]

/// `ffprobe` stream metadata for the first video stream of a container.
pub mod probe;
/// Decoder/encoder command construction and child process supervision.
pub mod process;

pub use probe::{SourceMetadata, parse_probe_output, probe_source};
pub use process::{
    DECODER, DecodeOptions, ENCODER, EncodeOptions, FfmpegProcess, RateControl, ToolPaths,
    decode_args, encode_args, render_command, spawn_decoder, spawn_encoder,
};

//! `ffmpeg` decoder/encoder child processes.
//!
//! The decoder turns any container into headerless `rgb48le` on its stdout;
//! the encoder reads the same layout on its stdin. Both inherit stderr so
//! ffmpeg's own diagnostics stay visible next to the pipeline logs.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};

use vboost_core::channel::ExternalProcess;
use vboost_core::error::{EngineError, Result};
use vboost_core::types::{FrameFormat, ProcessExit};

/// Environment variable overriding the `ffmpeg` executable.
pub const FFMPEG_ENV: &str = "VBOOST_FFMPEG";
/// Environment variable overriding the `ffprobe` executable.
pub const FFPROBE_ENV: &str = "VBOOST_FFPROBE";

/// Role name of the decoding process in logs and run reports.
pub const DECODER: &str = "decoder";
/// Role name of the encoding process in logs and run reports.
pub const ENCODER: &str = "encoder";

// ─── Tool discovery ──────────────────────────────────────────────────────────

/// Locations of the FFmpeg command-line tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for ToolPaths {
    /// Bare names, resolved through `PATH` at spawn time.
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl ToolPaths {
    /// Defaults overridden by `VBOOST_FFMPEG` / `VBOOST_FFPROBE` when set.
    pub fn from_env() -> Self {
        let mut tools = Self::default();
        if let Some(path) = std::env::var_os(FFMPEG_ENV).filter(|v| !v.is_empty()) {
            tools.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os(FFPROBE_ENV).filter(|v| !v.is_empty()) {
            tools.ffprobe = PathBuf::from(path);
        }
        tools
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Decoder invocation options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecodeOptions {
    /// `-hwaccel` value; `None` decodes in software.
    pub hwaccel: Option<String>,
    pub log_level: String,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            hwaccel: Some("cuda".into()),
            log_level: "error".into(),
        }
    }
}

/// Encoder rate control.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RateControl {
    /// Constant bitrate; `maxrate` equals `bitrate`.
    Cbr { bitrate: String, bufsize: String },
    /// Constant-quality VBR (`-cq`).
    ConstantQuality { cq: u8 },
}

impl Default for RateControl {
    fn default() -> Self {
        Self::Cbr {
            bitrate: "80M".into(),
            bufsize: "160M".into(),
        }
    }
}

/// Encoder invocation options. Defaults target 4:4:4 10-bit HEVC on NVENC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodeOptions {
    pub codec: String,
    pub profile: Option<String>,
    pub pix_fmt: String,
    pub preset: String,
    pub rate_control: RateControl,
    pub lookahead: Option<u32>,
    pub log_level: String,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            codec: "hevc_nvenc".into(),
            profile: Some("rext".into()),
            pix_fmt: "yuv444p10le".into(),
            preset: "p7".into(),
            rate_control: RateControl::default(),
            lookahead: Some(20),
            log_level: "error".into(),
        }
    }
}

// ─── Argument construction ───────────────────────────────────────────────────

fn push_all(args: &mut Vec<OsString>, items: &[&str]) {
    args.extend(items.iter().map(OsString::from));
}

/// Arguments for decoding `input` to raw `rgb48le` on stdout.
pub fn decode_args(opts: &DecodeOptions, input: &Path) -> Vec<OsString> {
    let mut args = Vec::new();
    push_all(&mut args, &["-hide_banner", "-nostdin", "-loglevel", &opts.log_level]);
    if let Some(hwaccel) = &opts.hwaccel {
        push_all(&mut args, &["-hwaccel", hwaccel]);
    }
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    push_all(
        &mut args,
        &[
            "-map",
            "0:v:0",
            "-f",
            "rawvideo",
            "-pix_fmt",
            FrameFormat::PIX_FMT,
            "-fps_mode",
            "passthrough",
            "-",
        ],
    );
    args
}

/// Arguments for encoding raw `rgb48le` frames of `format` from stdin to `output`.
pub fn encode_args(opts: &EncodeOptions, format: &FrameFormat, output: &Path) -> Vec<OsString> {
    let size = format!("{}x{}", format.width, format.height);
    let rate = format.frame_rate.to_string();

    let mut args = Vec::new();
    push_all(&mut args, &["-hide_banner", "-loglevel", &opts.log_level, "-y"]);
    push_all(
        &mut args,
        &[
            "-f",
            "rawvideo",
            "-pix_fmt",
            FrameFormat::PIX_FMT,
            "-s",
            &size,
            "-r",
            &rate,
            "-i",
            "-",
        ],
    );
    push_all(&mut args, &["-c:v", &opts.codec]);
    if let Some(profile) = &opts.profile {
        push_all(&mut args, &["-profile:v", profile]);
    }
    push_all(&mut args, &["-pix_fmt", &opts.pix_fmt, "-preset", &opts.preset]);
    match &opts.rate_control {
        RateControl::Cbr { bitrate, bufsize } => push_all(
            &mut args,
            &[
                "-rc", "cbr", "-b:v", bitrate, "-maxrate", bitrate, "-bufsize", bufsize,
            ],
        ),
        RateControl::ConstantQuality { cq } => {
            let cq = cq.to_string();
            push_all(&mut args, &["-rc", "vbr", "-cq", &cq, "-b:v", "0"]);
        }
    }
    if let Some(lookahead) = opts.lookahead {
        let lookahead = lookahead.to_string();
        push_all(&mut args, &["-rc-lookahead", &lookahead]);
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Render `program args...` as a copy-pasteable shell line.
pub fn render_command(program: &Path, args: &[OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|part| {
            let part = part.to_string_lossy();
            if part.is_empty() || part.contains(char::is_whitespace) {
                format!("'{part}'")
            } else {
                part.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Child processes ─────────────────────────────────────────────────────────

/// A spawned `ffmpeg` child playing one role in the pipeline.
pub struct FfmpegProcess {
    name: String,
    child: Child,
}

impl ExternalProcess for FfmpegProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn wait(&mut self) -> Result<ProcessExit> {
        let status = self
            .child
            .wait()
            .map_err(|e| EngineError::Process(format!("Failed to wait for {}: {e}", self.name)))?;
        let exit = ProcessExit {
            name: self.name.clone(),
            code: status.code(),
            success: status.success(),
        };
        tracing::debug!(process = %self.name, code = ?exit.code, "Process exited");
        Ok(exit)
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(EngineError::Process(format!(
                "Failed to kill {}: {e}",
                self.name
            ))),
        }
    }
}

fn spawn(name: &str, program: &Path, args: &[OsString], command: &mut Command) -> Result<Child> {
    let child = command.args(args).spawn().map_err(|e| {
        EngineError::Process(format!("Failed to spawn {name} ({}): {e}", program.display()))
    })?;
    tracing::info!(process = name, pid = child.id(), program = %program.display(), "Process spawned");
    Ok(child)
}

/// Start the decoder for `input`. Its stdout is the upstream frame channel.
pub fn spawn_decoder(
    tools: &ToolPaths,
    opts: &DecodeOptions,
    input: &Path,
) -> Result<(FfmpegProcess, ChildStdout)> {
    let args = decode_args(opts, input);
    let mut child = spawn(
        DECODER,
        &tools.ffmpeg,
        &args,
        Command::new(&tools.ffmpeg)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()),
    )?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Process("decoder stdout was not captured".into()))?;
    Ok((
        FfmpegProcess {
            name: DECODER.into(),
            child,
        },
        stdout,
    ))
}

/// Start the encoder writing `output`. Its stdin is the downstream frame channel.
pub fn spawn_encoder(
    tools: &ToolPaths,
    opts: &EncodeOptions,
    format: &FrameFormat,
    output: &Path,
) -> Result<(FfmpegProcess, ChildStdin)> {
    let args = encode_args(opts, format, output);
    let mut child = spawn(
        ENCODER,
        &tools.ffmpeg,
        &args,
        Command::new(&tools.ffmpeg)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()),
    )?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Process("encoder stdin was not captured".into()))?;
    Ok((
        FfmpegProcess {
            name: ENCODER.into(),
            child,
        },
        stdin,
    ))
}

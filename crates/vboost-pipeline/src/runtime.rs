//! CLI/runtime bridge helpers.
//!
//! Keeps run composition inside `vboost-pipeline` so the CLI depends on one
//! crate for device selection, configuration, and the two run modes:
//!
//! - `enhance`: ffprobe → device → ffmpeg decoder → pipeline → ffmpeg encoder
//! - `filter`: raw frames on stdin → pipeline → raw frames on stdout

use std::fmt;
use std::io::{Stdin, Stdout};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use vboost_core::channel::ExternalProcess;
use vboost_core::device::EnhanceDevice;
use vboost_core::error::{EngineError, Result};
use vboost_core::params::EnhanceSettings;
use vboost_core::types::{FrameFormat, FrameRate};
use vboost_cuda::{CpuReferenceDevice, CudaEnhanceDevice};
use vboost_ffmpeg::probe::{SourceMetadata, probe_source};
use vboost_ffmpeg::process::{
    DECODER, DecodeOptions, ENCODER, EncodeOptions, ToolPaths, decode_args, encode_args,
    render_command, spawn_decoder, spawn_encoder,
};

use crate::enhancer::DeviceEnhancer;
use crate::pipeline::{EnhancePipeline, PipelineConfig, PipelineReport};
use crate::sink::FrameSink;
use crate::source::FrameSource;

// ─── Device selection ───────────────────────────────────────────────────────

/// Which [`EnhanceDevice`] runs the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceChoice {
    /// Bit-exact CPU reference.
    Cpu,
    /// NVRTC-compiled kernel on CUDA device `ordinal`.
    Cuda { ordinal: usize },
}

impl Default for DeviceChoice {
    fn default() -> Self {
        Self::Cuda { ordinal: 0 }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda { ordinal } => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = EngineError;

    /// `cpu`, `cuda`, or `cuda:N`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda { ordinal: 0 }),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .map(|ordinal| Self::Cuda { ordinal })
                .ok_or_else(|| {
                    EngineError::Config(format!(
                        "Unknown device '{s}'. Use cpu, cuda, or cuda:N."
                    ))
                }),
        }
    }
}

impl TryFrom<String> for DeviceChoice {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceChoice> for String {
    fn from(choice: DeviceChoice) -> Self {
        choice.to_string()
    }
}

/// Open the selected device. Buffers are not allocated yet.
pub fn open_device(choice: DeviceChoice) -> Result<Box<dyn EnhanceDevice>> {
    match choice {
        DeviceChoice::Cpu => Ok(Box::new(CpuReferenceDevice::default())),
        DeviceChoice::Cuda { ordinal } => Ok(Box::new(CudaEnhanceDevice::new(ordinal)?)),
    }
}

// ─── Run configuration ──────────────────────────────────────────────────────

/// Everything a run needs besides its endpoints. Loadable from JSON; every
/// field is optional and falls back to its default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub device: DeviceChoice,
    pub enhance: EnhanceSettings,
    pub pipeline: PipelineConfig,
    pub decode: DecodeOptions,
    pub encode: EncodeOptions,
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("Invalid run config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), device = %config.device, "Run config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.enhance.validate()?;
        self.pipeline.validate()
    }
}

// ─── Format resolution ──────────────────────────────────────────────────────

/// Explicit format values that take precedence over probed ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<FrameRate>,
}

impl FormatOverrides {
    /// The full format, when every value was given explicitly.
    pub fn complete(&self) -> Option<Result<FrameFormat>> {
        match (self.width, self.height, self.frame_rate) {
            (Some(w), Some(h), Some(rate)) => Some(FrameFormat::rgb48(w, h, rate)),
            _ => None,
        }
    }
}

/// Determine the frame format once, before the pipeline starts.
///
/// Probes `input` unless the overrides already pin every value.
pub fn resolve_format(
    tools: &ToolPaths,
    input: &Path,
    overrides: FormatOverrides,
) -> Result<(FrameFormat, Option<SourceMetadata>)> {
    if let Some(format) = overrides.complete() {
        return Ok((format?, None));
    }
    let meta = probe_source(tools, input)?;
    let format = FrameFormat::rgb48(
        overrides.width.unwrap_or(meta.width),
        overrides.height.unwrap_or(meta.height),
        overrides.frame_rate.unwrap_or(meta.frame_rate),
    )?;
    Ok((format, Some(meta)))
}

// ─── Enhance run ────────────────────────────────────────────────────────────

/// A fully resolved file-to-file enhancement run.
#[derive(Clone, Debug)]
pub struct EnhanceJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: FrameFormat,
    pub config: RunConfig,
    pub tools: ToolPaths,
}

/// Shell renderings of the two ffmpeg invocations a job would spawn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedCommands {
    pub decoder: String,
    pub encoder: String,
}

impl EnhanceJob {
    pub fn planned_commands(&self) -> PlannedCommands {
        PlannedCommands {
            decoder: render_command(
                &self.tools.ffmpeg,
                &decode_args(&self.config.decode, &self.input),
            ),
            encoder: render_command(
                &self.tools.ffmpeg,
                &encode_args(&self.config.encode, &self.format, &self.output),
            ),
        }
    }
}

/// Decode `job.input`, enhance every frame, and encode to `job.output`.
///
/// The device is opened and allocated before any process is spawned. A
/// non-zero encoder exit fails the run; a non-zero decoder exit only warns.
pub async fn run_enhance(pipeline: &EnhancePipeline, job: &EnhanceJob) -> Result<PipelineReport> {
    job.config.validate()?;
    let device = open_device(job.config.device)?;
    let enhancer = DeviceEnhancer::new(device, job.format, job.config.enhance.tile)?;

    let (mut decoder, decoder_out) = spawn_decoder(&job.tools, &job.config.decode, &job.input)?;
    let (encoder, encoder_in) =
        match spawn_encoder(&job.tools, &job.config.encode, &job.format, &job.output) {
            Ok(spawned) => spawned,
            Err(e) => {
                drop(decoder_out);
                if let Err(kill_err) = decoder.kill() {
                    tracing::warn!(process = decoder.name(), error = %kill_err, "Kill failed");
                }
                if let Err(wait_err) = decoder.wait() {
                    tracing::warn!(process = decoder.name(), error = %wait_err, "Wait failed");
                }
                return Err(e);
            }
        };

    let source = FrameSource::new(decoder_out, job.format);
    let sink = FrameSink::new(encoder_in, job.format);
    let processes: Vec<Box<dyn ExternalProcess>> = vec![Box::new(decoder), Box::new(encoder)];

    let report = pipeline
        .run(source, enhancer, sink, job.config.enhance, processes)
        .await?;
    check_process_exits(&report)?;
    Ok(report)
}

/// Apply the exit policy: the encoder must succeed, the decoder may not.
pub fn check_process_exits(report: &PipelineReport) -> Result<()> {
    for exit in report.process_exits.iter().filter(|e| !e.success) {
        match exit.name.as_str() {
            ENCODER => {
                return Err(EngineError::Process(format!(
                    "encoder exited with {} after {} frames",
                    exit.code
                        .map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
                    report.frames_written
                )));
            }
            DECODER => tracing::warn!(
                code = ?exit.code,
                frames = report.frames_read,
                "Decoder exited non-zero after end of stream"
            ),
            other => tracing::warn!(process = other, code = ?exit.code, "Process failed"),
        }
    }
    Ok(())
}

// ─── Filter run ─────────────────────────────────────────────────────────────

/// Enhance raw `rgb48le` frames from stdin to stdout.
pub async fn run_filter(
    pipeline: &EnhancePipeline,
    format: FrameFormat,
    config: &RunConfig,
) -> Result<PipelineReport> {
    config.validate()?;
    let device = open_device(config.device)?;
    let enhancer = DeviceEnhancer::new(device, format, config.enhance.tile)?;
    let source: FrameSource<Stdin> = FrameSource::new(std::io::stdin(), format);
    let sink: FrameSink<Stdout> = FrameSink::new(std::io::stdout(), format);
    pipeline
        .run(source, enhancer, sink, config.enhance, Vec::new())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use vboost_core::types::ProcessExit;

    fn report_with(exits: Vec<ProcessExit>) -> PipelineReport {
        PipelineReport {
            device: "cpu".into(),
            frames_read: 5,
            frames_enhanced: 5,
            frames_written: 5,
            truncated_bytes: 0,
            phases: Vec::new(),
            process_exits: exits,
            elapsed_ms: 10,
            latencies: Default::default(),
        }
    }

    fn exit(name: &str, code: i32) -> ProcessExit {
        ProcessExit {
            name: name.into(),
            code: Some(code),
            success: code == 0,
        }
    }

    #[test]
    fn device_choice_parses_and_displays() {
        assert_eq!("cpu".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cpu);
        assert_eq!(
            "CUDA".parse::<DeviceChoice>().unwrap(),
            DeviceChoice::Cuda { ordinal: 0 }
        );
        assert_eq!(
            "cuda:2".parse::<DeviceChoice>().unwrap(),
            DeviceChoice::Cuda { ordinal: 2 }
        );
        assert!("cuda:x".parse::<DeviceChoice>().is_err());
        assert!("tpu".parse::<DeviceChoice>().is_err());
        assert_eq!(DeviceChoice::Cuda { ordinal: 1 }.to_string(), "cuda:1");
    }

    #[test]
    fn run_config_json_overrides_defaults() {
        let config = RunConfig::from_json_str(
            r#"{
                "device": "cpu",
                "enhance": { "contrast_boost": 1.35 },
                "pipeline": { "read_capacity": 4 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.device, DeviceChoice::Cpu);
        assert_eq!(config.enhance.contrast_boost, 1.35);
        assert_eq!(config.enhance.sharpen_strength, 0.8);
        assert_eq!(config.pipeline.read_capacity, 4);
        assert_eq!(config.encode, EncodeOptions::default());
    }

    #[test]
    fn run_config_rejects_invalid_values() {
        assert!(RunConfig::from_json_str(r#"{"device":"fpga"}"#).is_err());
        assert!(RunConfig::from_json_str(r#"{"enhance":{"tile":64}}"#).is_err());
        assert!(RunConfig::from_json_str(r#"{"unknown":true}"#).is_err());
    }

    #[test]
    fn explicit_overrides_skip_probe() {
        let overrides = FormatOverrides {
            width: Some(8),
            height: Some(2),
            frame_rate: Some(FrameRate::new(24, 1)),
        };
        let tools = ToolPaths {
            ffmpeg: "/nonexistent/ffmpeg".into(),
            ffprobe: "/nonexistent/ffprobe".into(),
        };
        let (format, meta) = resolve_format(&tools, Path::new("x.mov"), overrides).unwrap();
        assert_eq!(format.frame_byte_size(), 8 * 2 * 6);
        assert!(meta.is_none());
    }

    #[test]
    fn partial_overrides_need_probe() {
        let tools = ToolPaths {
            ffmpeg: "/nonexistent/ffmpeg".into(),
            ffprobe: "/nonexistent/ffprobe".into(),
        };
        let overrides = FormatOverrides {
            width: Some(8),
            ..Default::default()
        };
        let err = resolve_format(&tools, Path::new("x.mov"), overrides).unwrap_err();
        assert!(matches!(err, EngineError::Probe(_)));
    }

    #[test]
    fn encoder_failure_fails_run_but_decoder_failure_warns() {
        assert!(check_process_exits(&report_with(vec![exit(DECODER, 1), exit(ENCODER, 0)])).is_ok());
        let err = check_process_exits(&report_with(vec![exit(DECODER, 0), exit(ENCODER, 1)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Process(ref m) if m.contains("code 1")));
    }

    #[test]
    fn planned_commands_name_both_ends() {
        let job = EnhanceJob {
            input: "in.mov".into(),
            output: "out.mp4".into(),
            format: FrameFormat::rgb48(16, 16, FrameRate::new(25, 1)).unwrap(),
            config: RunConfig::default(),
            tools: ToolPaths::default(),
        };
        let planned = job.planned_commands();
        assert!(planned.decoder.starts_with("ffmpeg "));
        assert!(planned.decoder.contains("-i in.mov"));
        assert!(planned.encoder.contains("-s 16x16"));
        assert!(planned.encoder.ends_with("out.mp4"));
    }

    #[cfg(not(feature = "cuda-runtime"))]
    #[test]
    fn cuda_without_feature_is_unavailable() {
        let err = open_device(DeviceChoice::Cuda { ordinal: 0 })
            .err()
            .expect("cuda should be unavailable");
        assert!(matches!(err, EngineError::DeviceUnavailable(_)));
    }
}

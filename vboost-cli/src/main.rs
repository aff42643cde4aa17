//! vboost CLI entrypoint.
//!
//! ```bash
//! vboost enhance -i input.mov -o output.mp4
//! vboost enhance -i input.mov -o output.mp4 --preset vivid --device cuda:1
//! vboost enhance -i input.mov -o output.mp4 --dry-run --json
//! ffmpeg -i in.mov -f rawvideo -pix_fmt rgb48le - | vboost filter --width 1920 --height 1080 | ...
//! vboost probe input.mov --json
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

use vboost_core::error::{EngineError, Result};
use vboost_core::params::EnhanceSettings;
use vboost_core::types::{FrameFormat, FrameRate};
use vboost_ffmpeg::probe::probe_source;
use vboost_ffmpeg::process::ToolPaths;
use vboost_pipeline::pipeline::{EnhancePipeline, PipelineMetrics, PipelineReport};
use vboost_pipeline::runtime::{
    DeviceChoice, EnhanceJob, FormatOverrides, RunConfig, resolve_format, run_enhance, run_filter,
};

#[derive(Parser, Debug)]
#[command(
    name = "vboost",
    version,
    about = "16-bit video enhancement: sharpen, contrast, dither",
    arg_required_else_help = true,
    after_help = "Examples:\n  vboost enhance -i in.mov -o out.mp4\n  vboost enhance -i in.mov -o out.mp4 --preset vivid --progress jsonl\n  vboost filter --width 1920 --height 1080 < in.rgb48 > out.rgb48\n  vboost probe in.mov --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a video with ffmpeg, enhance every frame, and encode it.
    Enhance(EnhanceArgs),
    /// Enhance raw rgb48le frames from stdin to stdout.
    Filter(FilterArgs),
    /// Print the stream metadata the pipeline would use.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
struct TuningArgs {
    /// JSON run config; explicit flags override its values.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Enhancement device: cpu, cuda, or cuda:N.
    #[arg(short = 'd', long = "device")]
    device: Option<DeviceChoice>,

    /// Settings preset applied before the individual overrides.
    #[arg(long = "preset", value_enum)]
    preset: Option<PresetArg>,

    /// Unsharp strength (>= 0).
    #[arg(long = "sharpen")]
    sharpen: Option<f32>,

    /// Contrast gain around mid-gray (> 0).
    #[arg(long = "contrast")]
    contrast: Option<f32>,

    /// Thread tile edge for the kernel launch (1..=32).
    #[arg(long = "tile")]
    tile: Option<u32>,

    /// Channel capacity: read -> enhance.
    #[arg(long = "read-cap")]
    read_cap: Option<usize>,

    /// Channel capacity: enhance -> write.
    #[arg(long = "write-cap")]
    write_cap: Option<usize>,

    /// Progress output mode on stderr.
    #[arg(long = "progress", value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,

    /// Shorthand for `--progress jsonl`.
    #[arg(long = "jsonl", default_value_t = false)]
    jsonl: bool,
}

#[derive(Args, Debug, Clone)]
struct EnhanceArgs {
    /// Input video file.
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output video file.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Width override (skips probing when height and fps are also given).
    #[arg(long = "width")]
    width: Option<u32>,

    /// Height override.
    #[arg(long = "height")]
    height: Option<u32>,

    /// Frame rate override: `num/den`, integer, or decimal.
    #[arg(long = "fps")]
    fps: Option<FrameRate>,

    /// Resolve the format and print the planned ffmpeg commands without running.
    #[arg(long = "dry-run", default_value_t = false)]
    dry_run: bool,

    /// Emit a single JSON summary line on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug, Clone)]
struct FilterArgs {
    /// Frame width in pixels.
    #[arg(long = "width")]
    width: u32,

    /// Frame height in pixels.
    #[arg(long = "height")]
    height: u32,

    /// Nominal frame rate (informational for raw streams).
    #[arg(long = "fps", default_value = "30/1")]
    fps: FrameRate,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// Input video file.
    input: PathBuf,

    /// Emit JSON probe output.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    /// sharpen 0.8, contrast 1.05
    Default,
    /// sharpen 1.15, contrast 1.35
    Vivid,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Jsonl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    Off,
    Human,
    Jsonl,
}

struct ProgressReporter {
    notify: Arc<tokio::sync::Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    async fn stop(self) {
        // Stores a permit, so the stop is seen even if the task is between ticks.
        self.notify.notify_one();
        let _ = self.handle.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgressSnapshot {
    read: u64,
    enhanced: u64,
    written: u64,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Enhance(args) if args.json => Some("enhance"),
        Commands::Probe(args) if args.json => Some("probe"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Probe(args) => run_probe(args),
        Commands::Enhance(args) => build_runtime().and_then(|rt| rt.block_on(run_enhance_cmd(args))),
        Commands::Filter(args) => build_runtime().and_then(|rt| rt.block_on(run_filter_cmd(args))),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            }
            tracing::error!(
                error = %err,
                kind = err.kind(),
                frame = ?err.stopped_at(),
                code = err.error_code(),
                "Command failed"
            );
            std::process::exit(i32::from(err.error_code()));
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Pipeline(format!("Failed to build tokio runtime: {e}")))
}

// ─── Configuration ──────────────────────────────────────────────────────────

fn build_run_config(tuning: &TuningArgs) -> Result<RunConfig> {
    let mut config = match &tuning.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    if let Some(device) = tuning.device {
        config.device = device;
    }
    if let Some(preset) = tuning.preset {
        let base = match preset {
            PresetArg::Default => EnhanceSettings::default(),
            PresetArg::Vivid => EnhanceSettings::vivid(),
        };
        config.enhance.sharpen_strength = base.sharpen_strength;
        config.enhance.contrast_boost = base.contrast_boost;
    }
    if let Some(sharpen) = tuning.sharpen {
        config.enhance.sharpen_strength = sharpen;
    }
    if let Some(contrast) = tuning.contrast {
        config.enhance.contrast_boost = contrast;
    }
    if let Some(tile) = tuning.tile {
        config.enhance.tile = tile;
    }
    if let Some(cap) = tuning.read_cap {
        config.pipeline.read_capacity = cap;
    }
    if let Some(cap) = tuning.write_cap {
        config.pipeline.write_capacity = cap;
    }

    config.validate()?;
    Ok(config)
}

// ─── Commands ───────────────────────────────────────────────────────────────

fn run_probe(args: ProbeArgs) -> Result<()> {
    let tools = ToolPaths::from_env();
    let meta = probe_source(&tools, &args.input)?;
    let format = meta.frame_format()?;

    if args.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "probe",
            "ok": true,
            "input": args.input.display().to_string(),
            "source": meta,
            "frame_bytes": format.frame_byte_size(),
        });
        println!("{value}");
    } else {
        println!(
            "probe: input={} resolution={}x{} fps={} sar={} pix_fmt={} frame_bytes={}",
            args.input.display(),
            meta.width,
            meta.height,
            meta.frame_rate,
            meta.sample_aspect_ratio,
            meta.pix_fmt.as_deref().unwrap_or("unknown"),
            format.frame_byte_size()
        );
    }
    Ok(())
}

async fn run_enhance_cmd(args: EnhanceArgs) -> Result<()> {
    let config = build_run_config(&args.tuning)?;
    let tools = ToolPaths::from_env();
    let overrides = FormatOverrides {
        width: args.width,
        height: args.height,
        frame_rate: args.fps,
    };
    let (format, _meta) = resolve_format(&tools, &args.input, overrides)?;

    let job = EnhanceJob {
        input: args.input.clone(),
        output: args.output.clone(),
        format,
        config,
        tools,
    };

    if args.dry_run {
        let planned = job.planned_commands();
        if args.json {
            let value = json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "enhance",
                "ok": true,
                "dry_run": true,
                "input": job.input.display().to_string(),
                "output": job.output.display().to_string(),
                "format": format,
                "frame_bytes": format.frame_byte_size(),
                "device": job.config.device,
                "settings": job.config.enhance,
                "commands": planned,
            });
            println!("{value}");
        } else {
            println!(
                "dry-run: command=enhance input={} output={} format={} device={} sharpen={} contrast={}",
                job.input.display(),
                job.output.display(),
                format,
                job.config.device,
                job.config.enhance.sharpen_strength,
                job.config.enhance.contrast_boost
            );
            println!("  decoder: {}", planned.decoder);
            println!("  encoder: {}", planned.encoder);
        }
        return Ok(());
    }

    let pipeline = EnhancePipeline::new(job.config.pipeline.clone());
    let mode = resolve_progress_mode(args.tuning.progress, args.tuning.jsonl);
    let progress = spawn_progress_reporter("enhance", pipeline.metrics(), mode);

    let run_result = run_enhance(&pipeline, &job).await;
    if let Some(progress) = progress {
        progress.stop().await;
    }
    let report = run_result?;

    if args.json {
        println!("{}", enhance_json(&job.input, &job.output, &format, &report));
    } else {
        println!(
            "enhance: ok output={} frames={} elapsed_s={:.3} fps={:.2} device={}",
            job.output.display(),
            report.frames_written,
            report.elapsed_ms as f64 / 1000.0,
            report.fps(),
            report.device
        );
    }
    Ok(())
}

async fn run_filter_cmd(args: FilterArgs) -> Result<()> {
    let config = build_run_config(&args.tuning)?;
    let format = FrameFormat::rgb48(args.width, args.height, args.fps)?;

    let pipeline = EnhancePipeline::new(config.pipeline.clone());
    let mode = resolve_progress_mode(args.tuning.progress, args.tuning.jsonl);
    let progress = spawn_progress_reporter("filter", pipeline.metrics(), mode);

    let run_result = run_filter(&pipeline, format, &config).await;
    if let Some(progress) = progress {
        progress.stop().await;
    }
    let report = run_result?;

    // stdout carries frames; the summary goes to the log.
    tracing::info!(
        frames = report.frames_written,
        truncated_bytes = report.truncated_bytes,
        elapsed_ms = report.elapsed_ms,
        device = %report.device,
        "Filter complete"
    );
    Ok(())
}

// ─── Output ─────────────────────────────────────────────────────────────────

fn enhance_json(input: &Path, output: &Path, format: &FrameFormat, report: &PipelineReport) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "enhance",
        "ok": true,
        "dry_run": false,
        "input": input.display().to_string(),
        "output": output.display().to_string(),
        "format": format,
        "fps": report.fps(),
        "report": report,
    })
    .to_string()
}

fn command_error_json(command: &str, err: &EngineError) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "error_kind": err.kind(),
        "error_code": err.error_code(),
        "frame_index": err.stopped_at(),
    })
    .to_string()
}

// ─── Progress ───────────────────────────────────────────────────────────────

fn resolve_progress_mode(progress: ProgressArg, jsonl: bool) -> ProgressMode {
    if jsonl {
        return ProgressMode::Jsonl;
    }
    match progress {
        ProgressArg::Auto => {
            if std::io::stderr().is_terminal() {
                ProgressMode::Human
            } else {
                ProgressMode::Off
            }
        }
        ProgressArg::Off => ProgressMode::Off,
        ProgressArg::Human => ProgressMode::Human,
        ProgressArg::Jsonl => ProgressMode::Jsonl,
    }
}

fn current_progress_snapshot(metrics: &PipelineMetrics) -> ProgressSnapshot {
    ProgressSnapshot {
        read: metrics.frames_read.load(Ordering::Relaxed),
        enhanced: metrics.frames_enhanced.load(Ordering::Relaxed),
        written: metrics.frames_written.load(Ordering::Relaxed),
    }
}

fn emit_progress_line(
    command: &'static str,
    mode: ProgressMode,
    elapsed: Duration,
    snapshot: ProgressSnapshot,
    final_line: bool,
) {
    // Progress is written to stderr only; stdout is results or frames.
    match mode {
        ProgressMode::Off => {}
        ProgressMode::Human => {
            eprintln!(
                "progress: command={} elapsed_s={:.3} read={} enhanced={} written={} final={}",
                command,
                elapsed.as_secs_f64(),
                snapshot.read,
                snapshot.enhanced,
                snapshot.written,
                final_line
            );
        }
        ProgressMode::Jsonl => {
            let line = json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "type": "progress",
                "command": command,
                "elapsed_ms": elapsed.as_millis() as u64,
                "frames": {
                    "read": snapshot.read,
                    "enhanced": snapshot.enhanced,
                    "written": snapshot.written,
                },
                "final": final_line,
            });
            eprintln!("{line}");
        }
    }
}

fn spawn_progress_reporter(
    command: &'static str,
    metrics: Arc<PipelineMetrics>,
    mode: ProgressMode,
) -> Option<ProgressReporter> {
    if matches!(mode, ProgressMode::Off) {
        return None;
    }

    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_task = notify.clone();
    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let mut last = current_progress_snapshot(&metrics);
        loop {
            tokio::select! {
                _ = notify_task.notified() => {
                    let snapshot = current_progress_snapshot(&metrics);
                    emit_progress_line(command, mode, start.elapsed(), snapshot, true);
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let snapshot = current_progress_snapshot(&metrics);
                    if snapshot != last {
                        emit_progress_line(command, mode, start.elapsed(), snapshot, false);
                        last = snapshot;
                    }
                }
            }
        }
    });

    Some(ProgressReporter { notify, handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> TuningArgs {
        TuningArgs {
            config: None,
            device: None,
            preset: None,
            sharpen: None,
            contrast: None,
            tile: None,
            read_cap: None,
            write_cap: None,
            progress: ProgressArg::Off,
            jsonl: false,
        }
    }

    #[test]
    fn flags_override_preset() {
        let args = TuningArgs {
            preset: Some(PresetArg::Vivid),
            contrast: Some(1.2),
            device: Some(DeviceChoice::Cpu),
            ..tuning()
        };
        let config = build_run_config(&args).unwrap();
        assert_eq!(config.enhance.sharpen_strength, 1.15);
        assert_eq!(config.enhance.contrast_boost, 1.2);
        assert_eq!(config.device, DeviceChoice::Cpu);
    }

    #[test]
    fn invalid_override_is_config_error() {
        let args = TuningArgs {
            tile: Some(0),
            ..tuning()
        };
        assert!(matches!(build_run_config(&args), Err(EngineError::Config(_))));
    }

    #[test]
    fn jsonl_flag_wins_over_progress_arg() {
        assert_eq!(resolve_progress_mode(ProgressArg::Off, true), ProgressMode::Jsonl);
        assert_eq!(resolve_progress_mode(ProgressArg::Human, false), ProgressMode::Human);
    }

    #[test]
    fn error_json_carries_kind_and_frame() {
        let err = EngineError::Stopped {
            frame_index: 12,
            source: Box::new(EngineError::Sink("closed".into())),
        };
        let value: serde_json::Value =
            serde_json::from_str(&command_error_json("enhance", &err)).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error_kind"], "sink");
        assert_eq!(value["error_code"], 110);
        assert_eq!(value["frame_index"], 12);
    }
}

//! Bounded frame pipeline: read → enhance → write.
//!
//! # Architecture
//!
//! Three stages on the blocking thread pool, connected by bounded
//! `tokio::sync::mpsc` channels:
//!
//! ```text
//! ┌──────────┐  ch(2)  ┌───────────┐  ch(2)  ┌──────────┐
//! │   Read   │────────►│  Enhance  │────────►│  Write   │
//! │(blocking)│         │(blocking) │         │(blocking)│
//! └──────────┘         └───────────┘         └──────────┘
//! ```
//!
//! Channels are FIFO and each stage handles one frame at a time, so frames
//! reach the sink in index order. The device sees one frame at a time;
//! reading frame `i+1` and writing frame `i-1` overlap enhancing frame `i`.
//!
//! # Backpressure
//!
//! A full channel blocks the upstream stage in `blocking_send`. A blocking
//! write on the sink waits for the downstream consumer, so the encoder's
//! pace propagates back to the decoder with at most
//! `read_capacity + write_capacity + 3` frames in flight.
//!
//! # Shutdown protocol
//!
//! 1. **End of stream**: the read stage sees a clean or short end of stream,
//!    enters `Draining`, and drops its sender. The cascade closes the sink,
//!    then the driver waits for every external process to exit.
//! 2. **Failure**: the failing stage returns `Stopped { frame_index, .. }`.
//!    The driver records the first failure, cancels the other stages, and
//!    kills the external processes so no stage stays blocked on a pipe.
//!    All stages are joined and the processes reaped before returning.
//!
//! The write stage always closes the sink before returning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vboost_core::channel::{ExternalProcess, ReadableChannel, WritableChannel};
use vboost_core::device::EnhanceDevice;
use vboost_core::error::{EngineError, Result};
use vboost_core::params::EnhanceSettings;
use vboost_core::types::{Frame, PipelinePhase, PipelineState, ProcessExit};

use crate::enhancer::DeviceEnhancer;
use crate::sink::FrameSink;
use crate::source::FrameSource;

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Atomic per-stage frame counters and latency tracking.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Frames that have left the read stage.
    pub frames_read: AtomicU64,
    /// Frames that have left the enhance stage.
    pub frames_enhanced: AtomicU64,
    /// Frames fully written to the sink.
    pub frames_written: AtomicU64,
    /// Bytes of a trailing partial frame discarded at end of stream.
    pub truncated_bytes: AtomicU64,
    /// Cumulative read stage wall-clock time in microseconds.
    pub read_total_us: AtomicU64,
    /// Cumulative enhance stage wall-clock time in microseconds.
    pub enhance_total_us: AtomicU64,
    /// Cumulative write stage wall-clock time in microseconds.
    pub write_total_us: AtomicU64,
}

/// Average per-frame stage latencies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageLatencies {
    pub read_avg_us: u64,
    pub enhance_avg_us: u64,
    pub write_avg_us: u64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `read >= enhanced >= written`. Holds at every instant.
    pub fn validate(&self) -> bool {
        let written = self.frames_written.load(Ordering::Acquire);
        let enhanced = self.frames_enhanced.load(Ordering::Acquire);
        let read = self.frames_read.load(Ordering::Acquire);
        read >= enhanced && enhanced >= written
    }

    pub fn latencies(&self) -> StageLatencies {
        let avg = |total: &AtomicU64, count: &AtomicU64| -> u64 {
            let count = count.load(Ordering::Relaxed);
            if count > 0 {
                total.load(Ordering::Relaxed) / count
            } else {
                0
            }
        };
        StageLatencies {
            read_avg_us: avg(&self.read_total_us, &self.frames_read),
            enhance_avg_us: avg(&self.enhance_total_us, &self.frames_enhanced),
            write_avg_us: avg(&self.write_total_us, &self.frames_written),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.frames_read,
            &self.frames_enhanced,
            &self.frames_written,
            &self.truncated_bytes,
            &self.read_total_us,
            &self.enhance_total_us,
            &self.write_total_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Log stage latencies (avg microseconds).
    pub fn report(&self) {
        let latencies = self.latencies();
        info!(
            read_avg_us = latencies.read_avg_us,
            enhance_avg_us = latencies.enhance_avg_us,
            write_avg_us = latencies.write_avg_us,
            "Stage latencies"
        );
    }
}

// ─── Config ─────────────────────────────────────────────────────────────────

/// Channel depths between stages and the progress log cadence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Bounded capacity of the read → enhance channel.
    pub read_capacity: usize,
    /// Bounded capacity of the enhance → write channel.
    pub write_capacity: usize,
    /// Emit a debug progress line every this many written frames.
    pub progress_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_capacity: 2,
            write_capacity: 2,
            progress_interval: 100,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.read_capacity == 0 || self.write_capacity == 0 {
            return Err(EngineError::Config(format!(
                "channel capacities must be >= 1 (read={}, write={})",
                self.read_capacity, self.write_capacity
            )));
        }
        if self.progress_interval == 0 {
            return Err(EngineError::Config(
                "progress_interval must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ─── Report ─────────────────────────────────────────────────────────────────

/// Outcome of a completed run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineReport {
    pub device: String,
    pub frames_read: u64,
    pub frames_enhanced: u64,
    pub frames_written: u64,
    pub truncated_bytes: u64,
    pub phases: Vec<PipelinePhase>,
    pub process_exits: Vec<ProcessExit>,
    pub elapsed_ms: u64,
    pub latencies: StageLatencies,
}

impl PipelineReport {
    pub fn fps(&self) -> f64 {
        if self.elapsed_ms == 0 {
            0.0
        } else {
            self.frames_written as f64 * 1000.0 / self.elapsed_ms as f64
        }
    }
}

// ─── Driver state ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct DriverState {
    phase: PipelinePhase,
    phases: Vec<PipelinePhase>,
    last_error: Option<String>,
}

impl DriverState {
    fn enter(&mut self, phase: PipelinePhase) {
        if self.phases.last() == Some(&phase) {
            return;
        }
        debug!(?phase, "Pipeline phase");
        self.phase = phase;
        self.phases.push(phase);
    }
}

#[derive(Clone, Debug)]
struct SharedState(Arc<Mutex<DriverState>>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(DriverState {
            phase: PipelinePhase::Running,
            phases: Vec::new(),
            last_error: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, phase: PipelinePhase) {
        self.lock().enter(phase);
    }
}

fn stopped(frame_index: u64, source: EngineError) -> EngineError {
    match source {
        already @ EngineError::Stopped { .. } => already,
        source => EngineError::Stopped {
            frame_index,
            source: Box::new(source),
        },
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Bounded frame pipeline: read → enhance → write.
pub struct EnhancePipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    state: SharedState,
}

impl EnhancePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            metrics: PipelineMetrics::new(),
            state: SharedState::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cancelling this token stops the current run at the next frame boundary
    /// and kills its external processes. The run then returns `Stopped`.
    /// A failed run does not cancel it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared atomic counters, live during a run.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Point-in-time view of the run.
    pub fn state(&self) -> PipelineState {
        let state = self.state.lock();
        PipelineState {
            phase: state.phase,
            frames_read: self.metrics.frames_read.load(Ordering::Acquire),
            frames_written: self.metrics.frames_written.load(Ordering::Acquire),
            last_error: state.last_error.clone(),
        }
    }

    /// Phases entered so far in the current run, in order.
    pub fn phases(&self) -> Vec<PipelinePhase> {
        self.state.lock().phases.clone()
    }

    /// Run until end of stream or the first fatal error.
    ///
    /// `processes` are the external collaborators at either end of the
    /// channels. They are waited on after the pipeline drains and killed if
    /// it fails.
    ///
    /// # Shutdown guarantee
    ///
    /// When this function returns, every stage has been joined, the sink has
    /// been closed, and every process has been reaped.
    #[instrument(
        skip_all,
        name = "enhance_pipeline",
        fields(device = enhancer.device_name(), format = %source.format())
    )]
    pub async fn run<R, D, W>(
        &self,
        source: FrameSource<R>,
        enhancer: DeviceEnhancer<D>,
        sink: FrameSink<W>,
        settings: EnhanceSettings,
        mut processes: Vec<Box<dyn ExternalProcess>>,
    ) -> Result<PipelineReport>
    where
        R: ReadableChannel,
        D: EnhanceDevice,
        W: WritableChannel,
    {
        self.config.validate()?;
        settings.validate()?;

        let device = enhancer.device_name().to_string();
        self.metrics.reset();
        {
            let mut state = self.state.lock();
            state.phases.clear();
            state.last_error = None;
            state.enter(PipelinePhase::Running);
        }
        let started = Instant::now();
        // Stage failures cancel this run only; the pipeline token stays usable.
        let cancel = self.cancel.child_token();

        let (tx_read, rx_read) = mpsc::channel::<Frame>(self.config.read_capacity);
        let (tx_enhanced, rx_enhanced) = mpsc::channel::<Frame>(self.config.write_capacity);

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        // ── Stage 1: Read (blocking — waits on the upstream pipe) ──
        {
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            let state = self.state.clone();
            tasks.spawn_blocking(move || read_stage(source, &tx_read, &cancel, &metrics, &state));
        }

        // ── Stage 2: Enhance (blocking — synchronous device transfers) ──
        {
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            tasks.spawn_blocking(move || {
                enhance_stage(rx_read, &tx_enhanced, enhancer, &settings, &cancel, &metrics)
            });
        }

        // ── Stage 3: Write (blocking — waits on the downstream pipe) ──
        {
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            let interval = self.config.progress_interval;
            tasks.spawn_blocking(move || write_stage(rx_enhanced, sink, &cancel, &metrics, interval));
        }

        // ── Collect results — shutdown barrier ──

        let mut first_error: Option<EngineError> = None;
        let mut killed = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(result) = joined else { break };
                    let failure = match result {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e,
                        Err(join_err) => stopped(
                            self.metrics.frames_written.load(Ordering::Acquire),
                            EngineError::Pipeline(format!("Stage task panicked: {join_err}")),
                        ),
                    };
                    error!(
                        error = %failure,
                        kind = failure.kind(),
                        frame = ?failure.stopped_at(),
                        "Pipeline stage failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(failure);
                    }
                    cancel.cancel();
                }
                // A stage may be blocked on a pipe; killing the process unblocks it.
                _ = cancel.cancelled(), if !killed => {
                    kill_all(&mut processes);
                    killed = true;
                }
            }
        }

        if cancel.is_cancelled() && !killed {
            kill_all(&mut processes);
        }

        // Cancelled from outside with no stage failure.
        if first_error.is_none() && cancel.is_cancelled() {
            first_error = Some(stopped(
                self.metrics.frames_written.load(Ordering::Acquire),
                EngineError::Pipeline("run cancelled".into()),
            ));
        }

        // ── Post-shutdown: reap processes, report ──

        let process_exits = tokio::task::spawn_blocking(move || reap_all(processes))
            .await
            .map_err(|e| EngineError::Pipeline(format!("Process reaper panicked: {e}")))?;

        debug_assert!(self.metrics.validate(), "pipeline ordering violation");

        {
            let mut state = self.state.lock();
            state.last_error = first_error.as_ref().map(ToString::to_string);
            state.enter(PipelinePhase::Stopped);
        }

        let report = PipelineReport {
            device,
            frames_read: self.metrics.frames_read.load(Ordering::Acquire),
            frames_enhanced: self.metrics.frames_enhanced.load(Ordering::Acquire),
            frames_written: self.metrics.frames_written.load(Ordering::Acquire),
            truncated_bytes: self.metrics.truncated_bytes.load(Ordering::Acquire),
            phases: self.phases(),
            process_exits,
            elapsed_ms: started.elapsed().as_millis() as u64,
            latencies: self.metrics.latencies(),
        };

        info!(
            read = report.frames_read,
            enhanced = report.frames_enhanced,
            written = report.frames_written,
            truncated_bytes = report.truncated_bytes,
            elapsed_ms = report.elapsed_ms,
            "Pipeline finished"
        );
        self.metrics.report();

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn kill_all(processes: &mut [Box<dyn ExternalProcess>]) {
    for process in processes.iter_mut() {
        if let Err(e) = process.kill() {
            warn!(process = process.name(), %e, "Kill failed");
        }
    }
}

fn reap_all(mut processes: Vec<Box<dyn ExternalProcess>>) -> Vec<ProcessExit> {
    let mut exits = Vec::with_capacity(processes.len());
    for process in processes.iter_mut() {
        match process.wait() {
            Ok(exit) => {
                if exit.success {
                    info!(process = %exit.name, "Process exited cleanly");
                } else {
                    warn!(process = %exit.name, code = ?exit.code, "Process exited with failure");
                }
                exits.push(exit);
            }
            Err(e) => warn!(process = process.name(), %e, "Wait failed"),
        }
    }
    exits
}

// ═══════════════════════════════════════════════════════════════════════════════
//  STAGE IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Stage 1 — Read.
///
/// `blocking_send` propagates backpressure from the enhance stage.
fn read_stage<R: ReadableChannel>(
    mut source: FrameSource<R>,
    tx: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
    metrics: &PipelineMetrics,
    state: &SharedState,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            debug!("Read stage cancelled");
            return Ok(());
        }
        let t_read = Instant::now();
        match source.read_frame() {
            Ok(Some(frame)) => {
                let read_us = t_read.elapsed().as_micros() as u64;
                metrics.read_total_us.fetch_add(read_us, Ordering::Relaxed);
                metrics.frames_read.fetch_add(1, Ordering::Release);
                if tx.blocking_send(frame).is_err() {
                    debug!("Read: downstream closed");
                    return Ok(());
                }
            }
            Ok(None) => {
                metrics
                    .truncated_bytes
                    .store(source.truncated_bytes(), Ordering::Release);
                state.enter(PipelinePhase::Draining);
                info!(frames = source.frames_read(), "Read: EOS, draining");
                return Ok(());
            }
            Err(e) => return Err(stopped(source.frames_read(), e)),
        }
    }
}

/// Stage 2 — Enhance.
///
/// Seeds every frame from its own index, so output does not depend on
/// stage timing.
fn enhance_stage<D: EnhanceDevice>(
    mut rx: mpsc::Receiver<Frame>,
    tx: &mpsc::Sender<Frame>,
    mut enhancer: DeviceEnhancer<D>,
    settings: &EnhanceSettings,
    cancel: &CancellationToken,
    metrics: &PipelineMetrics,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            debug!("Enhance stage cancelled");
            return Ok(());
        }
        match rx.blocking_recv() {
            Some(frame) => {
                let index = frame.index;
                let params = settings.kernel_params(index);
                let t_enhance = Instant::now();
                let enhanced = enhancer
                    .enhance(frame, &params)
                    .map_err(|e| stopped(index, e))?;
                let enhance_us = t_enhance.elapsed().as_micros() as u64;
                metrics
                    .enhance_total_us
                    .fetch_add(enhance_us, Ordering::Relaxed);
                metrics.frames_enhanced.fetch_add(1, Ordering::Release);
                if tx.blocking_send(enhanced).is_err() {
                    debug!("Enhance: downstream closed");
                    return Ok(());
                }
            }
            None => {
                let n = metrics.frames_enhanced.load(Ordering::Acquire);
                debug!(frames = n, "Enhance: upstream drained");
                return Ok(());
            }
        }
    }
}

/// Stage 3 — Write.
///
/// Closes the sink before returning on every path, which signals end of
/// input to the downstream consumer.
fn write_stage<W: WritableChannel>(
    mut rx: mpsc::Receiver<Frame>,
    mut sink: FrameSink<W>,
    cancel: &CancellationToken,
    metrics: &PipelineMetrics,
    progress_interval: u64,
) -> Result<()> {
    let outcome = drain_into_sink(&mut rx, &mut sink, cancel, metrics, progress_interval);
    drop(rx);
    let closed = sink
        .close()
        .map_err(|e| stopped(sink.frames_written(), e));
    outcome.and(closed)
}

fn drain_into_sink<W: WritableChannel>(
    rx: &mut mpsc::Receiver<Frame>,
    sink: &mut FrameSink<W>,
    cancel: &CancellationToken,
    metrics: &PipelineMetrics,
    progress_interval: u64,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            debug!("Write stage cancelled, closing sink");
            return Ok(());
        }
        match rx.blocking_recv() {
            Some(frame) => {
                let t_write = Instant::now();
                sink.write_frame(&frame)
                    .map_err(|e| stopped(frame.index, e))?;
                let write_us = t_write.elapsed().as_micros() as u64;
                metrics.write_total_us.fetch_add(write_us, Ordering::Relaxed);
                let written = metrics.frames_written.fetch_add(1, Ordering::Release) + 1;
                if written % progress_interval == 0 {
                    debug!(
                        frames = written,
                        bytes_mb = sink.bytes_written() / (1024 * 1024),
                        "Write progress"
                    );
                }
            }
            None => {
                let n = metrics.frames_written.load(Ordering::Acquire);
                info!(frames = n, "Write: EOS, closing sink");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        let config = PipelineConfig {
            read_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn config_deserializes_partial_json() {
        let config: PipelineConfig = serde_json::from_str(r#"{"write_capacity":8}"#).unwrap();
        assert_eq!(config.write_capacity, 8);
        assert_eq!(config.read_capacity, 2);
    }

    #[test]
    fn stopped_keeps_innermost_frame_index() {
        let inner = stopped(3, EngineError::Sink("closed".into()));
        let outer = stopped(9, inner);
        assert_eq!(outer.stopped_at(), Some(3));
        assert_eq!(outer.error_code(), 110);
    }

    #[test]
    fn phase_log_ignores_repeats() {
        let state = SharedState::new();
        state.enter(PipelinePhase::Running);
        state.enter(PipelinePhase::Running);
        state.enter(PipelinePhase::Draining);
        state.enter(PipelinePhase::Stopped);
        assert_eq!(
            state.lock().phases,
            [
                PipelinePhase::Running,
                PipelinePhase::Draining,
                PipelinePhase::Stopped
            ]
        );
    }

    #[test]
    fn latencies_are_zero_without_frames() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.latencies(), StageLatencies::default());
        assert!(metrics.validate());
    }
}

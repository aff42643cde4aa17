//! Typed error hierarchy for the frame pipeline.
//!
//! Uses `thiserror` for library-grade errors. End-of-stream and short reads
//! are not errors: the frame source reports them as `Ok(None)`.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`].
//! The CLI uses the code as its exit status, so every code fits in a byte.

/// All errors originating from the vboost engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Device ───────────────────────────────────────────────────────
    #[error("Device error: {0}")]
    Device(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    // ── Byte channels ────────────────────────────────────────────────
    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Source error: {0}")]
    Source(String),

    // ── External collaborators ───────────────────────────────────────
    #[error("Probe error: {0}")]
    Probe(String),

    #[error("External process error: {0}")]
    Process(String),

    // ── Configuration / contracts ────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Frame size mismatch: expected {expected} samples, got {actual}")]
    FormatMismatch { expected: usize, actual: usize },

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,

    #[error("Pipeline stopped at frame {frame_index}: {source}")]
    Stopped {
        frame_index: u64,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Stable integer error code for telemetry and process exit status.
    ///
    /// Codes are grouped by category:
    /// - 10x: device
    /// - 11x: byte channels
    /// - 12x: external collaborators
    /// - 13x: configuration / contracts
    /// - 14x: pipeline
    ///
    /// `Stopped` reports the code of the error that stopped the run.
    pub fn error_code(&self) -> u8 {
        match self {
            Self::Device(_) => 100,
            Self::DeviceUnavailable(_) => 101,
            Self::Sink(_) => 110,
            Self::Source(_) => 111,
            Self::Probe(_) => 120,
            Self::Process(_) => 121,
            Self::Config(_) => 130,
            Self::FormatMismatch { .. } => 131,
            Self::Pipeline(_) => 140,
            Self::ChannelClosed => 141,
            Self::Stopped { source, .. } => source.error_code(),
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Device(_) => "device",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::Sink(_) => "sink",
            Self::Source(_) => "source",
            Self::Probe(_) => "probe",
            Self::Process(_) => "process",
            Self::Config(_) => "config",
            Self::FormatMismatch { .. } => "format_mismatch",
            Self::Pipeline(_) => "pipeline",
            Self::ChannelClosed => "channel_closed",
            Self::Stopped { source, .. } => source.kind(),
        }
    }

    /// Frame index at which the run stopped, if this error ended a run.
    pub fn stopped_at(&self) -> Option<u64> {
        match self {
            Self::Stopped { frame_index, .. } => Some(*frame_index),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn stopped_reports_originating_code_and_kind() {
        let err = EngineError::Stopped {
            frame_index: 7,
            source: Box::new(EngineError::Sink("broken pipe".into())),
        };
        assert_eq!(err.error_code(), 110);
        assert_eq!(err.kind(), "sink");
        assert_eq!(err.stopped_at(), Some(7));
        let msg = err.to_string();
        assert!(msg.contains("frame 7"));
        assert!(msg.contains("broken pipe"));
    }

    #[test]
    fn codes_are_nonzero() {
        for err in [
            EngineError::Device("x".into()),
            EngineError::Source("x".into()),
            EngineError::Config("x".into()),
            EngineError::ChannelClosed,
        ] {
            assert_ne!(err.error_code(), 0);
            assert_eq!(err.stopped_at(), None);
        }
    }
}

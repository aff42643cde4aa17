//! Container probing via the `ffprobe` command-line tool.
//!
//! Only the first video stream is inspected. Frame rate resolution prefers
//! `avg_frame_rate`, falls back to `r_frame_rate`, then to 30/1 when neither
//! is a usable rational (ffprobe reports `0/0` for unknown rates).

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use vboost_core::error::{EngineError, Result};
use vboost_core::types::{FrameFormat, FrameRate};

use crate::process::ToolPaths;

const SHOW_ENTRIES: &str =
    "stream=width,height,avg_frame_rate,r_frame_rate,pix_fmt,sample_aspect_ratio";

/// Metadata extracted from a container's first video stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceMetadata {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// `W:H`, `1:1` when the container does not say.
    pub sample_aspect_ratio: String,
    /// Source pixel format, informational only (decoding always converts to rgb48le).
    pub pix_fmt: Option<String>,
}

impl SourceMetadata {
    /// The raw frame format the decoder will emit for this source.
    pub fn frame_format(&self) -> Result<FrameFormat> {
        FrameFormat::rgb48(self.width, self.height, self.frame_rate)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    pix_fmt: Option<String>,
    sample_aspect_ratio: Option<String>,
}

fn usable_rate(raw: Option<&str>) -> Option<FrameRate> {
    raw.and_then(|s| s.parse::<FrameRate>().ok())
        .filter(|rate| rate.is_valid())
}

/// Run `ffprobe` on `path` and parse its JSON output.
pub fn probe_source(tools: &ToolPaths, path: &Path) -> Result<SourceMetadata> {
    let output = Command::new(&tools.ffprobe)
        .args(["-v", "error", "-select_streams", "v:0", "-show_entries"])
        .arg(SHOW_ENTRIES)
        .args(["-of", "json"])
        .arg(path)
        .output()
        .map_err(|e| {
            EngineError::Probe(format!(
                "Failed to run {}: {e}",
                tools.ffprobe.display()
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Probe(format!(
            "ffprobe failed on {} ({}): {}",
            path.display(),
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let meta = parse_probe_output(&stdout)?;

    tracing::info!(
        path = %path.display(),
        width = meta.width,
        height = meta.height,
        fps = %meta.frame_rate,
        sar = %meta.sample_aspect_ratio,
        pix_fmt = meta.pix_fmt.as_deref().unwrap_or("unknown"),
        "Source probed"
    );

    Ok(meta)
}

/// Parse `ffprobe -of json` output into [`SourceMetadata`].
pub fn parse_probe_output(json: &str) -> Result<SourceMetadata> {
    let parsed: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| EngineError::Probe(format!("Unparseable ffprobe output: {e}")))?;

    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Probe("No video stream found".into()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        (w, h) => {
            return Err(EngineError::Probe(format!(
                "Video stream has no usable dimensions (width={w:?}, height={h:?})"
            )));
        }
    };

    let frame_rate = usable_rate(stream.avg_frame_rate.as_deref())
        .or_else(|| usable_rate(stream.r_frame_rate.as_deref()))
        .unwrap_or_default();

    let sample_aspect_ratio = stream
        .sample_aspect_ratio
        .filter(|sar| !sar.is_empty() && sar != "0:1")
        .unwrap_or_else(|| "1:1".to_string());

    Ok(SourceMetadata {
        width,
        height,
        frame_rate,
        sample_aspect_ratio,
        pix_fmt: stream.pix_fmt.filter(|p| !p.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_ffprobe_output() {
        let json = r#"{
            "programs": [],
            "streams": [
                {
                    "width": 3840,
                    "height": 2160,
                    "pix_fmt": "yuv420p10le",
                    "sample_aspect_ratio": "1:1",
                    "r_frame_rate": "60000/1001",
                    "avg_frame_rate": "60000/1001"
                }
            ]
        }"#;
        let meta = parse_probe_output(json).unwrap();
        assert_eq!(meta.width, 3840);
        assert_eq!(meta.height, 2160);
        assert_eq!(meta.frame_rate, FrameRate::new(60000, 1001));
        assert_eq!(meta.pix_fmt.as_deref(), Some("yuv420p10le"));
        assert_eq!(meta.frame_format().unwrap().frame_byte_size(), 3840 * 2160 * 6);
    }

    #[test]
    fn unknown_avg_rate_falls_back_to_r_frame_rate() {
        let json = r#"{"streams":[{"width":640,"height":480,
            "avg_frame_rate":"0/0","r_frame_rate":"25/1"}]}"#;
        let meta = parse_probe_output(json).unwrap();
        assert_eq!(meta.frame_rate, FrameRate::new(25, 1));
    }

    #[test]
    fn missing_rates_default_to_thirty() {
        let json = r#"{"streams":[{"width":640,"height":480,"avg_frame_rate":"0/0"}]}"#;
        let meta = parse_probe_output(json).unwrap();
        assert_eq!(meta.frame_rate, FrameRate::new(30, 1));
        assert_eq!(meta.sample_aspect_ratio, "1:1");
        assert_eq!(meta.pix_fmt, None);
    }

    #[test]
    fn no_streams_is_probe_error() {
        let err = parse_probe_output(r#"{"streams":[]}"#).unwrap_err();
        assert!(matches!(err, EngineError::Probe(_)));
        let err = parse_probe_output("{}").unwrap_err();
        assert!(matches!(err, EngineError::Probe(_)));
    }

    #[test]
    fn garbled_output_is_probe_error() {
        let err = parse_probe_output("not json").unwrap_err();
        assert_eq!(err.error_code(), 120);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let json = r#"{"streams":[{"width":0,"height":480}]}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(EngineError::Probe(_))
        ));
    }
}

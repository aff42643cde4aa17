//! Whole-frame writes to a downstream byte channel.

use std::io::ErrorKind;

use vboost_core::channel::WritableChannel;
use vboost_core::error::{EngineError, Result};
use vboost_core::types::{Frame, FrameFormat};

/// Writes [`Frame`]s of one fixed format, in the order given.
///
/// Each frame is written with a single `write_all` of exactly
/// `frame_byte_size` bytes. [`close`](Self::close) flushes and drops the
/// channel, which is how the downstream consumer learns there is no more data.
pub struct FrameSink<W: WritableChannel> {
    writer: Option<W>,
    format: FrameFormat,
    buf: Vec<u8>,
    frames_written: u64,
    bytes_written: u64,
}

impl<W: WritableChannel> FrameSink<W> {
    pub fn new(writer: W, format: FrameFormat) -> Self {
        Self {
            writer: Some(writer),
            buf: Vec::with_capacity(format.frame_byte_size()),
            format,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let expected = self.format.sample_count();
        if frame.samples.len() != expected {
            return Err(EngineError::FormatMismatch {
                expected,
                actual: frame.samples.len(),
            });
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or(EngineError::ChannelClosed)?;

        frame.write_le_bytes(&mut self.buf);
        writer.write_all(&self.buf).map_err(|e| {
            if e.kind() == ErrorKind::BrokenPipe {
                EngineError::Sink(format!("downstream closed at frame {}", frame.index))
            } else {
                EngineError::Sink(format!("write failed at frame {}: {e}", frame.index))
            }
        })?;

        self.frames_written += 1;
        self.bytes_written += self.buf.len() as u64;
        Ok(())
    }

    /// Flush and release the channel. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let flushed = writer.flush();
        drop(writer);
        flushed.map_err(|e| EngineError::Sink(format!("flush failed on close: {e}")))?;

        tracing::info!(
            frames = self.frames_written,
            bytes_mb = self.bytes_written / (1024 * 1024),
            "Sink closed"
        );
        Ok(())
    }
}

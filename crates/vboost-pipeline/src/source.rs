//! Exact-size frame reads from an upstream byte channel.
//!
//! A read that returns zero bytes at a frame boundary is a clean end of
//! stream. A read that ends mid-frame is a short read: the partial bytes are
//! discarded, logged, and the stream ends. Neither case is an error. Only a
//! hard I/O failure on the channel is.

use std::io::ErrorKind;

use vboost_core::channel::ReadableChannel;
use vboost_core::error::{EngineError, Result};
use vboost_core::types::{Frame, FrameFormat};

/// Reads whole [`Frame`]s of one fixed format.
pub struct FrameSource<R: ReadableChannel> {
    reader: R,
    format: FrameFormat,
    buf: Vec<u8>,
    frames_read: u64,
    truncated_bytes: u64,
    finished: bool,
}

impl<R: ReadableChannel> FrameSource<R> {
    pub fn new(reader: R, format: FrameFormat) -> Self {
        Self {
            reader,
            buf: vec![0u8; format.frame_byte_size()],
            format,
            frames_read: 0,
            truncated_bytes: 0,
            finished: false,
        }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Frames delivered so far. Also the index of the next frame.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Bytes of a trailing partial frame discarded at end of stream.
    pub fn truncated_bytes(&self) -> u64 {
        self.truncated_bytes
    }

    /// Read the next frame, or `Ok(None)` at end of stream.
    ///
    /// Blocks until the channel has a full frame, closes, or fails. Once the
    /// stream has ended every later call returns `Ok(None)` without reading.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }

        let want = self.buf.len();
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Err(EngineError::Source(format!(
                        "Read failed at frame {}: {e}",
                        self.frames_read
                    )));
                }
            }
        }

        if filled == want {
            let frame = Frame::from_le_bytes(self.frames_read, &self.buf);
            self.frames_read += 1;
            return Ok(Some(frame));
        }

        self.finished = true;
        if filled == 0 {
            tracing::info!(frames = self.frames_read, "Source: end of stream");
        } else {
            self.truncated_bytes = filled as u64;
            tracing::warn!(
                frames = self.frames_read,
                partial_bytes = filled,
                frame_bytes = want,
                "Source: short read, discarding partial frame"
            );
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};

    use super::*;
    use vboost_core::types::FrameRate;

    fn format_2x2() -> FrameFormat {
        FrameFormat::rgb48(2, 2, FrameRate::default()).unwrap()
    }

    /// Hands out at most `chunk` bytes per read.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.data.read(&mut buf[..n])
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn reads_whole_frames_then_end_of_stream() {
        let format = format_2x2();
        let mut bytes = Vec::new();
        let mut wire = Vec::new();
        for i in 0..3u16 {
            Frame::filled(0, &format, 1000 + i).write_le_bytes(&mut wire);
            bytes.extend_from_slice(&wire);
        }
        let mut source = FrameSource::new(Cursor::new(bytes), format);

        for i in 0..3u64 {
            let frame = source.read_frame().unwrap().expect("frame");
            assert_eq!(frame.index, i);
            assert_eq!(frame.samples, vec![1000 + i as u16; 12]);
        }
        assert!(source.read_frame().unwrap().is_none());
        assert!(source.read_frame().unwrap().is_none());
        assert_eq!(source.frames_read(), 3);
        assert_eq!(source.truncated_bytes(), 0);
    }

    #[test]
    fn partial_trailing_frame_is_discarded() {
        let format = format_2x2();
        let bytes = vec![0u8; format.frame_byte_size() * 2 + 10];
        let mut source = FrameSource::new(Cursor::new(bytes), format);

        assert!(source.read_frame().unwrap().is_some());
        assert!(source.read_frame().unwrap().is_some());
        assert!(source.read_frame().unwrap().is_none());
        assert_eq!(source.frames_read(), 2);
        assert_eq!(source.truncated_bytes(), 10);
    }

    #[test]
    fn frames_assemble_across_small_reads() {
        let format = format_2x2();
        let size = format.frame_byte_size();
        let data: Vec<u8> = (0..size * 2).map(|i| (i % 251) as u8).collect();
        let reader = Trickle {
            data: Cursor::new(data.clone()),
            chunk: 5,
        };
        let mut source = FrameSource::new(reader, format);

        let first = source.read_frame().unwrap().expect("first");
        let second = source.read_frame().unwrap().expect("second");
        assert_eq!(first, Frame::from_le_bytes(0, &data[..size]));
        assert_eq!(second, Frame::from_le_bytes(1, &data[size..]));
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn empty_channel_is_immediate_end_of_stream() {
        let mut source = FrameSource::new(Cursor::new(Vec::new()), format_2x2());
        assert!(source.read_frame().unwrap().is_none());
        assert_eq!(source.frames_read(), 0);
    }

    #[test]
    fn hard_io_failure_is_source_error() {
        let mut source = FrameSource::new(Broken, format_2x2());
        let err = source.read_frame().unwrap_err();
        assert!(matches!(err, EngineError::Source(_)));
        assert!(source.read_frame().unwrap().is_none());
    }
}

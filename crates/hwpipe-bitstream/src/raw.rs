//! Raw planar YUV file I/O.
//!
//! Files hold densely packed pictures back to back, planes in order, no
//! header.  Geometry and format come from the command line.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use hwpipe_core::codec_traits::{ArtifactSink, ArtifactSource};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::types::{Artifact, Frame, PixelFormat, Residency};

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Reads fixed-size raw pictures and yields host-resident frames.
pub struct RawFrameReader<R> {
    input: R,
    width: u32,
    height: u32,
    format: PixelFormat,
    buf: Vec<u8>,
    frames: u64,
    done: bool,
}

impl<R: Read> RawFrameReader<R> {
    pub fn new(input: R, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            input,
            width,
            height,
            format,
            buf: vec![0; format.frame_size(width, height)],
            frames: 0,
            done: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    /// Fill `buf` completely; returns the number of bytes read before EOF.
    fn fill(&mut self) -> io::Result<usize> {
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.input.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        let filled = self
            .fill()
            .map_err(|e| EngineError::Demux(format!("raw frame read failed: {e}")))?;
        if filled < self.buf.len() {
            self.done = true;
            if filled > 0 {
                warn!(
                    bytes = filled,
                    frame_size = self.buf.len(),
                    "Dropping partial trailing frame"
                );
            }
            info!(frames = self.frames, "Raw input exhausted");
            return Ok(None);
        }
        let mut frame = Frame::from_dense(self.width, self.height, self.format, &self.buf)?;
        frame.pts = self.frames as i64;
        frame.frame_index = self.frames;
        self.frames += 1;
        Ok(Some(frame))
    }
}

impl<R: Read + Send> ArtifactSource for RawFrameReader<R> {
    fn next_input(&mut self) -> Result<Option<Artifact>> {
        Ok(self.next_frame()?.map(Artifact::Frame))
    }
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Writes host frames densely, dropping stride padding.
pub struct RawFrameWriter<W: Write> {
    output: W,
    label: String,
    frames: u64,
    bytes: u64,
}

impl RawFrameWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| EngineError::Mux(format!("cannot create {}: {e}", path.display())))?;
        info!(path = %path.display(), "Raw frame sink opened");
        Ok(Self::new(
            BufWriter::with_capacity(4 * 1024 * 1024, file),
            path.display().to_string(),
        ))
    }
}

impl<W: Write> RawFrameWriter<W> {
    pub fn new(output: W, label: impl Into<String>) -> Self {
        Self {
            output,
            label: label.into(),
            frames: 0,
            bytes: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.residency != Residency::Host {
            return Err(EngineError::Mux(format!(
                "frame {} is device-resident; download it before writing",
                frame.frame_index
            )));
        }
        frame.validate()?;
        for plane in 0..frame.planes.len() {
            for y in 0..frame.format.rows(plane, frame.height) {
                let row = frame.row(plane, y);
                self.output.write_all(row).map_err(|e| {
                    EngineError::Mux(format!("write to {} failed: {e}", self.label))
                })?;
                self.bytes += row.len() as u64;
            }
        }
        self.frames += 1;
        if self.frames.is_multiple_of(100) {
            debug!(frames = self.frames, bytes_mb = self.bytes / (1024 * 1024), "Raw sink progress");
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: Write + Send> ArtifactSink for RawFrameWriter<W> {
    fn write(&mut self, artifact: Artifact) -> Result<()> {
        match artifact {
            Artifact::Frame(frame) => self.write_frame(&frame),
            other => Err(EngineError::Mux(format!(
                "raw frame sink cannot write {} artifacts",
                other.label()
            ))),
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.output
            .flush()
            .map_err(|e| EngineError::Mux(format!("flush of {} failed: {e}", self.label)))?;
        info!(path = %self.label, frames = self.frames, bytes = self.bytes, "Raw sink flushed");
        Ok(())
    }
}

/// `<prefix>_0.yuv`, the decode flow's output file.
pub fn raw_output_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}_0.yuv"))
}

#[cfg(test)]
mod tests {
    use hwpipe_core::types::Plane;

    use super::*;

    #[test]
    fn reads_whole_frames_and_drops_partial_tail() {
        let size = PixelFormat::Yuv420p.frame_size(4, 2);
        assert_eq!(size, 12);
        let mut bytes: Vec<u8> = (0..(size * 2) as u8).collect();
        bytes.extend_from_slice(&[9, 9, 9]);

        let mut reader = RawFrameReader::new(bytes.as_slice(), 4, 2, PixelFormat::Yuv420p);
        let first = reader.next_frame().expect("read").expect("frame 0");
        assert_eq!(first.planes[0].data, &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(first.planes[1].data, &[8, 9]);
        let second = reader.next_frame().expect("read").expect("frame 1");
        assert_eq!(second.frame_index, 1);
        assert_eq!(second.pts, 1);
        assert!(reader.next_frame().expect("read").is_none());
        assert_eq!(reader.frames_read(), 2);
    }

    #[test]
    fn writer_strips_stride_padding() {
        let mut frame = Frame::alloc(2, 2, PixelFormat::Yuv420p, Residency::Host);
        frame.planes[0] = Plane {
            data: vec![1, 2, 0xEE, 3, 4, 0xEE],
            stride: 3,
        };
        frame.planes[1].data = vec![5];
        frame.planes[2].data = vec![6];

        let mut writer = RawFrameWriter::new(Vec::new(), "memory");
        writer.write(Artifact::Frame(frame)).expect("write");
        writer.finish().expect("finish");
        assert_eq!(writer.into_inner(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn device_frames_are_rejected() {
        let frame = Frame::alloc(2, 2, PixelFormat::Nv12, Residency::Device);
        let mut writer = RawFrameWriter::new(Vec::new(), "memory");
        let err = writer.write_frame(&frame).expect_err("device frame");
        assert!(err.to_string().contains("device-resident"));
    }

    #[test]
    fn output_path_uses_channel_zero() {
        assert_eq!(raw_output_path("out/clip"), PathBuf::from("out/clip_0.yuv"));
    }
}

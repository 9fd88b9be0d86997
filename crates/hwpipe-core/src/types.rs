//! Frame, packet and artifact types exchanged between stages.
//!
//! # Ownership model
//!
//! Every [`Artifact`] is an owned value.  A stage hands its output to the
//! caller by returning it from `receive`, so the caller holds the only
//! reference until it passes the artifact on (or drops it).  Nothing in a
//! stage can overwrite an artifact the orchestrator is still holding.
//!
//! Artifacts that live on a remote server cross the call boundary as
//! [`ArtifactHandle`]s instead; the server owns the backing memory.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Compressed bitstream flavour handled by the extractor and codec stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// H.264 / AVC, selector `1`.
    H264,
    /// H.265 / HEVC, selector `2`.
    Hevc,
}

impl CodecKind {
    /// Numeric selector used on the command line (`1` = AVC, `2` = HEVC).
    pub const fn selector(self) -> u32 {
        match self {
            Self::H264 => 1,
            Self::Hevc => 2,
        }
    }

    pub const fn from_selector(selector: u32) -> Option<Self> {
        match selector {
            1 => Some(Self::H264),
            2 => Some(Self::Hevc),
            _ => None,
        }
    }

    /// File extension for raw Annex-B output.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
        })
    }
}

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Host-visible layout of a decoded picture.
///
/// All formats are 4:2:0.  Chroma dimensions round up for odd geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Three 8-bit planes: Y, U, V.
    #[default]
    Yuv420p,
    /// 8-bit Y plane followed by one interleaved UV plane.
    Nv12,
    /// Three 16-bit little-endian planes carrying 10-bit samples.
    Yuv420p10le,
}

impl PixelFormat {
    pub const fn plane_count(self) -> usize {
        match self {
            Self::Yuv420p | Self::Yuv420p10le => 3,
            Self::Nv12 => 2,
        }
    }

    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::Yuv420p | Self::Nv12 => 1,
            Self::Yuv420p10le => 2,
        }
    }

    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Yuv420p | Self::Nv12 => 8,
            Self::Yuv420p10le => 10,
        }
    }

    /// Visible bytes per row of `plane` for a picture `width` pixels wide.
    pub const fn row_bytes(self, plane: usize, width: u32) -> usize {
        let width = width as usize;
        let chroma = width.div_ceil(2);
        match (self, plane) {
            (_, 0) => width * self.bytes_per_sample(),
            // Interleaved U and V samples.
            (Self::Nv12, _) => chroma * 2,
            _ => chroma * self.bytes_per_sample(),
        }
    }

    /// Number of rows in `plane` for a picture `height` pixels tall.
    pub const fn rows(self, plane: usize, height: u32) -> usize {
        if plane == 0 {
            height as usize
        } else {
            (height as usize).div_ceil(2)
        }
    }

    /// Dense byte size of one picture (stride == row bytes).
    pub const fn frame_size(self, width: u32, height: u32) -> usize {
        let mut total = 0;
        let mut plane = 0;
        while plane < self.plane_count() {
            total += self.row_bytes(plane, width) * self.rows(plane, height);
            plane += 1;
        }
        total
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// Where a frame's pixels currently live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    /// Host memory, readable by sinks.
    #[default]
    Host,
    /// Accelerator memory, only meaningful to stages on the same device.
    Device,
}

/// One image plane: bytes plus the row stride used to address them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Distance in bytes between the starts of consecutive rows.
    pub stride: usize,
}

/// A decoded picture.
///
/// # Invariants
///
/// 1. `planes.len() == format.plane_count()`.
/// 2. Each plane's `stride >= format.row_bytes(plane, width)`.
/// 3. Each plane holds at least `stride * rows` bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
    /// Presentation timestamp in frame-rate ticks.
    pub pts: i64,
    /// Zero-based index of the frame within its stream.
    pub frame_index: u64,
    pub residency: Residency,
}

impl Frame {
    /// Allocate a zeroed frame with dense strides.
    pub fn alloc(width: u32, height: u32, format: PixelFormat, residency: Residency) -> Self {
        let planes = (0..format.plane_count())
            .map(|p| {
                let stride = format.row_bytes(p, width);
                Plane {
                    data: vec![0; stride * format.rows(p, height)],
                    stride,
                }
            })
            .collect();
        Self {
            width,
            height,
            format,
            planes,
            pts: 0,
            frame_index: 0,
            residency,
        }
    }

    /// Build a host frame from one densely packed picture.
    pub fn from_dense(width: u32, height: u32, format: PixelFormat, bytes: &[u8]) -> Result<Self> {
        let need = format.frame_size(width, height);
        if bytes.len() < need {
            return Err(EngineError::BufferTooSmall {
                need,
                have: bytes.len(),
            });
        }
        let mut frame = Self::alloc(width, height, format, Residency::Host);
        let mut offset = 0;
        for plane in &mut frame.planes {
            let len = plane.data.len();
            plane.data.copy_from_slice(&bytes[offset..offset + len]);
            offset += len;
        }
        Ok(frame)
    }

    /// Check the layout invariants listed on the type.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::DimensionMismatch(format!(
                "frame has empty geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.planes.len() != self.format.plane_count() {
            return Err(EngineError::DimensionMismatch(format!(
                "{:?} frame needs {} planes, has {}",
                self.format,
                self.format.plane_count(),
                self.planes.len()
            )));
        }
        for (p, plane) in self.planes.iter().enumerate() {
            let row = self.format.row_bytes(p, self.width);
            if plane.stride < row {
                return Err(EngineError::DimensionMismatch(format!(
                    "plane {p} stride {} shorter than row of {row} bytes",
                    plane.stride
                )));
            }
            let need = plane.stride * self.format.rows(p, self.height);
            if plane.data.len() < need {
                return Err(EngineError::BufferTooSmall {
                    need,
                    have: plane.data.len(),
                });
            }
        }
        Ok(())
    }

    /// Visible bytes of row `y` in `plane`, skipping stride padding.
    pub fn row(&self, plane: usize, y: usize) -> &[u8] {
        let p = &self.planes[plane];
        let start = y * p.stride;
        &p.data[start..start + self.format.row_bytes(plane, self.width)]
    }

    /// Total bytes held by all planes, including padding.
    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

// ─── Compressed data ─────────────────────────────────────────────────────────

/// One delimited access unit copied out of the byte window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitstreamPacket {
    /// Annex-B bytes, starting at the unit's first start code.
    pub data: Vec<u8>,
    /// Presentation timestamp; the extractor uses the unit index.
    pub pts: i64,
    /// Whether this unit contains an IDR / IRAP picture.
    pub is_keyframe: bool,
}

/// Encoder output for one channel of a (possibly multi-output) encoder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBuffer {
    /// Index of the output rung that produced this buffer.
    pub channel: usize,
    pub data: Vec<u8>,
    pub pts: i64,
    pub is_keyframe: bool,
}

// ─── Artifact ────────────────────────────────────────────────────────────────

/// Shape of an artifact, without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Packet,
    Frame,
    Ladder,
    Encoded,
}

impl ArtifactKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Packet => "packet",
            Self::Frame => "frame",
            Self::Ladder => "ladder",
            Self::Encoded => "encoded",
        }
    }
}

/// Opaque reference to an artifact kept by a remote stage server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub id: u64,
    pub kind: ArtifactKind,
}

/// Anything a stage consumes or produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Artifact {
    /// Compressed input for a decoder.
    Packet(BitstreamPacket),
    /// A single decoded or scaled picture.
    Frame(Frame),
    /// One picture per output rung of a multi-output scaler.
    Ladder(Vec<Frame>),
    /// One buffer per encoder channel that produced output this call.
    Encoded(Vec<EncodedBuffer>),
    /// Server-resident artifact passed by reference.
    Handle(ArtifactHandle),
}

impl Artifact {
    /// Kind of the underlying payload; handles report what they point at.
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Packet(_) => ArtifactKind::Packet,
            Self::Frame(_) => ArtifactKind::Frame,
            Self::Ladder(_) => ArtifactKind::Ladder,
            Self::Encoded(_) => ArtifactKind::Encoded,
            Self::Handle(handle) => handle.kind,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Handle(_) => "handle",
            other => other.kind().label(),
        }
    }

    /// Payload size in bytes; handles count as zero.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Packet(p) => p.data.len(),
            Self::Frame(f) => f.byte_len(),
            Self::Ladder(frames) => frames.iter().map(Frame::byte_len).sum(),
            Self::Encoded(buffers) => buffers.iter().map(|b| b.data.len()).sum(),
            Self::Handle(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420p_sizes_round_chroma_up() {
        let f = PixelFormat::Yuv420p;
        assert_eq!(f.row_bytes(0, 5), 5);
        assert_eq!(f.row_bytes(1, 5), 3);
        assert_eq!(f.rows(2, 3), 2);
        assert_eq!(f.frame_size(4, 2), 8 + 2 + 2);
        assert_eq!(PixelFormat::Nv12.row_bytes(1, 5), 6);
        assert_eq!(PixelFormat::Yuv420p10le.frame_size(2, 2), 2 * (4 + 1 + 1));
    }

    #[test]
    fn from_dense_splits_planes_in_order() {
        let bytes: Vec<u8> = (0..12).collect();
        let frame = Frame::from_dense(4, 2, PixelFormat::Yuv420p, &bytes).expect("dense frame");
        assert_eq!(frame.planes[0].data, (0..8).collect::<Vec<u8>>());
        assert_eq!(frame.planes[1].data, vec![8, 9]);
        assert_eq!(frame.planes[2].data, vec![10, 11]);
        frame.validate().expect("valid layout");
    }

    #[test]
    fn from_dense_rejects_short_input() {
        let err = Frame::from_dense(4, 4, PixelFormat::Yuv420p, &[0; 10])
            .expect_err("short buffer must fail");
        assert!(matches!(err, EngineError::BufferTooSmall { need: 24, have: 10 }));
    }

    #[test]
    fn row_skips_stride_padding() {
        let mut frame = Frame::alloc(2, 2, PixelFormat::Yuv420p, Residency::Host);
        frame.planes[0] = Plane {
            data: vec![1, 2, 0xEE, 0xEE, 3, 4, 0xEE, 0xEE],
            stride: 4,
        };
        frame.validate().expect("padded layout is valid");
        assert_eq!(frame.row(0, 1), &[3, 4]);
    }

    #[test]
    fn validate_rejects_short_stride() {
        let mut frame = Frame::alloc(4, 2, PixelFormat::Yuv420p, Residency::Host);
        frame.planes[0].stride = 3;
        let err = frame.validate().expect_err("stride below row width");
        assert!(err.to_string().contains("stride"));
    }

    #[test]
    fn handle_reports_pointee_kind() {
        let a = Artifact::Handle(ArtifactHandle {
            id: 7,
            kind: ArtifactKind::Frame,
        });
        assert_eq!(a.kind(), ArtifactKind::Frame);
        assert_eq!(a.label(), "handle");
        assert_eq!(a.byte_len(), 0);
    }
}

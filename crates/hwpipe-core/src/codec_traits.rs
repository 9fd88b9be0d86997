//! Source and sink traits at the edges of a pipeline.
//!
//! These live in `hwpipe-core` so `hwpipe-bitstream` (file I/O) and
//! `hwpipe-pipeline` (orchestration) can meet without depending on each
//! other.

use crate::error::Result;
use crate::types::Artifact;

// ─── Pipeline input ──────────────────────────────────────────────────────

/// Feeds stage 1 of a pipeline.
///
/// Implementations: access-unit reader (Annex-B input), raw frame reader.
pub trait ArtifactSource: Send {
    /// The next input, or `None` once the input is exhausted.
    fn next_input(&mut self) -> Result<Option<Artifact>>;
}

// ─── Pipeline output ─────────────────────────────────────────────────────

/// Receives whatever the last stage emits.
pub trait ArtifactSink: Send {
    /// Consume one artifact.  Ownership ends here.
    fn write(&mut self, artifact: Artifact) -> Result<()>;
    /// Flush buffers and finalise outputs.
    fn finish(&mut self) -> Result<()>;
}

// ─── Bitstream sink (encoder channel → file) ─────────────────────────────

/// Receives encoded bitstream output for one channel.
///
/// Implementations: file writer, stdout writer, in-memory capture.
pub trait BitstreamSink: Send {
    /// Write one encoded buffer.
    fn write_packet(&mut self, data: &[u8], pts: i64, is_keyframe: bool) -> Result<()>;
    /// Flush any internal buffers and finalise the output stream.
    fn flush(&mut self) -> Result<()>;
}

//! File-based [`BitstreamSink`] and the per-channel encoder sink.
//!
//! Encoded channels are written as raw Annex-B elementary streams, one file
//! per output rung (`<prefix>_<channel>.<ext>`).  The files play directly
//! in most players and remux into a container without re-encoding.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use hwpipe_core::codec_traits::{ArtifactSink, BitstreamSink};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::types::{Artifact, CodecKind};

/// Writes one Annex-B elementary stream.
pub struct FileBitstreamSink {
    writer: BufWriter<Box<dyn Write + Send>>,
    bytes_written: u64,
    packets_written: u64,
    label: String,
}

impl FileBitstreamSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            EngineError::Mux(format!(
                "Failed to create output file {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(path = %path.display(), "Output bitstream sink opened");
        Ok(Self::from_writer(Box::new(file), path.display().to_string()))
    }

    /// Sink on standard output.
    pub fn stdout() -> Self {
        Self::from_writer(Box::new(io::stdout()), "<stdout>".into())
    }

    fn from_writer(inner: Box<dyn Write + Send>, label: String) -> Self {
        Self {
            writer: BufWriter::with_capacity(4 * 1024 * 1024, inner), // 4 MiB buffer
            bytes_written: 0,
            packets_written: 0,
            label,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }
}

impl BitstreamSink for FileBitstreamSink {
    fn write_packet(&mut self, data: &[u8], _pts: i64, _is_keyframe: bool) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| EngineError::Mux(format!("Failed to write to {}: {}", self.label, e)))?;

        self.bytes_written += data.len() as u64;
        self.packets_written += 1;

        if self.packets_written.is_multiple_of(100) {
            debug!(
                output = %self.label,
                packets = self.packets_written,
                bytes_mb = self.bytes_written / (1024 * 1024),
                "Sink progress"
            );
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| EngineError::Mux(format!("Failed to flush {}: {}", self.label, e)))?;

        info!(
            output = %self.label,
            packets = self.packets_written,
            bytes = self.bytes_written,
            "Sink flushed"
        );

        Ok(())
    }
}

// ─── Per-channel routing ─────────────────────────────────────────────────────

/// Routes `Artifact::Encoded` buffers to one [`BitstreamSink`] per channel.
///
/// Channels without a sink (stdout mode keeps only channel 0) are dropped
/// with a single warning per channel.
pub struct ChannelSinks {
    sinks: Vec<Option<Box<dyn BitstreamSink>>>,
    warned: Vec<bool>,
    buffers: u64,
}

impl ChannelSinks {
    pub fn new(sinks: Vec<Option<Box<dyn BitstreamSink>>>) -> Self {
        let warned = vec![false; sinks.len()];
        Self {
            sinks,
            warned,
            buffers: 0,
        }
    }

    /// One file per channel, named by [`channel_output_path`].
    pub fn create_files(prefix: &str, codecs: &[CodecKind]) -> Result<Self> {
        let sinks = codecs
            .iter()
            .enumerate()
            .map(|(channel, &codec)| {
                let path = channel_output_path(prefix, channel, codec);
                FileBitstreamSink::create(&path).map(|s| Some(Box::new(s) as Box<dyn BitstreamSink>))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(sinks))
    }

    /// Channel 0 on stdout; other channels are discarded.
    pub fn stdout(channels: usize) -> Self {
        let mut sinks: Vec<Option<Box<dyn BitstreamSink>>> = Vec::with_capacity(channels.max(1));
        let stdout: Box<dyn BitstreamSink> = Box::new(FileBitstreamSink::stdout());
        sinks.push(Some(stdout));
        sinks.resize_with(channels.max(1), || None);
        Self::new(sinks)
    }

    pub fn channels(&self) -> usize {
        self.sinks.len()
    }

    /// Encoded buffers routed to a sink so far.
    pub fn buffers_written(&self) -> u64 {
        self.buffers
    }
}

impl ArtifactSink for ChannelSinks {
    fn write(&mut self, artifact: Artifact) -> Result<()> {
        let buffers = match artifact {
            Artifact::Encoded(buffers) => buffers,
            other => {
                return Err(EngineError::Mux(format!(
                    "bitstream sink cannot write {} artifacts",
                    other.label()
                )));
            }
        };
        for buffer in buffers {
            let Some(slot) = self.sinks.get_mut(buffer.channel) else {
                return Err(EngineError::Mux(format!(
                    "encoder channel {} has no output (configured {})",
                    buffer.channel,
                    self.sinks.len()
                )));
            };
            match slot {
                Some(sink) => {
                    sink.write_packet(&buffer.data, buffer.pts, buffer.is_keyframe)?;
                    self.buffers += 1;
                }
                None => {
                    if !self.warned[buffer.channel] {
                        self.warned[buffer.channel] = true;
                        warn!(channel = buffer.channel, "No sink for encoder channel, dropping its output");
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for sink in self.sinks.iter_mut().flatten() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// `<prefix>_<channel>.<ext>` with the extension following the codec.
pub fn channel_output_path(prefix: &str, channel: usize, codec: CodecKind) -> PathBuf {
    PathBuf::from(format!("{prefix}_{channel}.{}", codec.extension()))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use hwpipe_core::types::EncodedBuffer;

    use super::*;

    /// Shared in-memory sink for assertions.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl BitstreamSink for Capture {
        fn write_packet(&mut self, data: &[u8], _pts: i64, _key: bool) -> Result<()> {
            self.0.lock().expect("lock").extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn boxed(capture: &Capture) -> Option<Box<dyn BitstreamSink>> {
        Some(Box::new(capture.clone()))
    }

    fn buffer(channel: usize, byte: u8) -> EncodedBuffer {
        EncodedBuffer {
            channel,
            data: vec![0, 0, 1, byte],
            pts: 0,
            is_keyframe: false,
        }
    }

    #[test]
    fn routes_buffers_by_channel() {
        let a = Capture::default();
        let b = Capture::default();
        let mut sinks = ChannelSinks::new(vec![boxed(&a), boxed(&b)]);

        sinks
            .write(Artifact::Encoded(vec![buffer(0, 1), buffer(1, 2), buffer(0, 3)]))
            .expect("write");
        sinks.finish().expect("finish");

        assert_eq!(*a.0.lock().expect("lock"), vec![0, 0, 1, 1, 0, 0, 1, 3]);
        assert_eq!(*b.0.lock().expect("lock"), vec![0, 0, 1, 2]);
        assert_eq!(sinks.buffers_written(), 3);
    }

    #[test]
    fn missing_channels_are_dropped_not_fatal() {
        let a = Capture::default();
        let mut sinks = ChannelSinks::new(vec![boxed(&a), None]);
        sinks.write(Artifact::Encoded(vec![buffer(1, 9)])).expect("drop");
        sinks.write(Artifact::Encoded(vec![buffer(1, 9)])).expect("drop again");
        assert!(a.0.lock().expect("lock").is_empty());
    }

    #[test]
    fn out_of_range_channel_is_an_error() {
        let mut sinks = ChannelSinks::new(vec![None]);
        let err = sinks
            .write(Artifact::Encoded(vec![buffer(3, 0)]))
            .expect_err("channel 3");
        assert!(err.to_string().contains("channel 3"));
    }

    #[test]
    fn file_sink_writes_every_packet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("ladder");
        let prefix = prefix.to_string_lossy();
        let mut sinks =
            ChannelSinks::create_files(&prefix, &[CodecKind::H264, CodecKind::Hevc]).expect("create");
        sinks
            .write(Artifact::Encoded(vec![buffer(0, 0x65), buffer(1, 0x26)]))
            .expect("write");
        sinks.finish().expect("finish");

        let h264 = std::fs::read(dir.path().join("ladder_0.h264")).expect("channel 0");
        let hevc = std::fs::read(dir.path().join("ladder_1.hevc")).expect("channel 1");
        assert_eq!(h264, vec![0, 0, 1, 0x65]);
        assert_eq!(hevc, vec![0, 0, 1, 0x26]);
    }
}

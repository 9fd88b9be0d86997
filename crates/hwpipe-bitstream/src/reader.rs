//! Pull-based access-unit reader over any `io::Read`.
//!
//! Wraps a [`ByteWindow`] and the extractor: refills on `NeedMoreData`,
//! drops units too large for the window, and resolves the trailing unit at
//! end of input according to [`TrailingUnit`].

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hwpipe_core::codec_traits::ArtifactSource;
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::types::{Artifact, BitstreamPacket, CodecKind};

use crate::extract::{self, Extraction, ScanProgress};
use crate::window::{ByteWindow, DEFAULT_WINDOW_CAPACITY};

/// What to do with the last unit when input ends before a closing marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingUnit {
    /// Drop it.  A stream with a single marker yields no units.
    #[default]
    Discard,
    /// Emit it when it carries picture data.
    Emit,
}

impl std::str::FromStr for TrailingUnit {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discard" => Ok(Self::Discard),
            "emit" => Ok(Self::Emit),
            other => Err(EngineError::InvalidParams(format!(
                "unknown trailing-unit policy '{other}' (expected discard or emit)"
            ))),
        }
    }
}

/// Counters reported after a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub units: u64,
    pub bytes_read: u64,
    pub bytes_consumed: u64,
    pub bytes_skipped: u64,
    pub oversize_dropped: u64,
    pub trailing_discarded: bool,
}

/// Yields one [`BitstreamPacket`] per access unit, in input order.
pub struct AccessUnitReader<R> {
    input: R,
    window: ByteWindow,
    codec: CodecKind,
    progress: ScanProgress,
    trailing: TrailingUnit,
    eof: bool,
    finished: bool,
    units: u64,
    oversize_dropped: u64,
    trailing_discarded: bool,
}

impl<R: Read> AccessUnitReader<R> {
    pub fn new(input: R, codec: CodecKind) -> Self {
        Self::with_capacity(input, codec, DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(input: R, codec: CodecKind, capacity: usize) -> Self {
        Self {
            input,
            window: ByteWindow::new(capacity),
            codec,
            progress: ScanProgress::default(),
            trailing: TrailingUnit::default(),
            eof: false,
            finished: false,
            units: 0,
            oversize_dropped: 0,
            trailing_discarded: false,
        }
    }

    pub fn trailing_unit(mut self, policy: TrailingUnit) -> Self {
        self.trailing = policy;
        self
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn progress(&self) -> ScanProgress {
        self.progress
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            units: self.units,
            bytes_read: self.progress.total_read,
            bytes_consumed: self.progress.consumed,
            bytes_skipped: self.progress.skipped,
            oversize_dropped: self.oversize_dropped,
            trailing_discarded: self.trailing_discarded,
        }
    }

    /// Next access unit, or `None` once the input is exhausted.
    pub fn next_unit(&mut self) -> Result<Option<BitstreamPacket>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if let Extraction::Unit(unit) = extract::extract(&self.window, &mut self.progress, self.codec) {
                let data = unit.bytes(&self.window).to_vec();
                self.window.advance_to(unit.end);
                return Ok(Some(self.packet(data, unit.is_keyframe)));
            }

            if self.eof {
                return Ok(self.finish());
            }

            self.skip_to_first_marker();
            self.window.compact();
            if self.window.is_full() {
                self.drop_oversize_unit();
            }

            let n = self
                .window
                .refill(&mut self.input)
                .map_err(|e| EngineError::Demux(format!("read failed: {e}")))?;
            self.progress.total_read += n as u64;
            if n == 0 {
                self.eof = true;
                debug!(bytes_read = self.progress.total_read, "Bitstream input exhausted");
            }
        }
    }

    fn packet(&mut self, data: Vec<u8>, is_keyframe: bool) -> BitstreamPacket {
        let pts = self.units as i64;
        self.units += 1;
        BitstreamPacket {
            data,
            pts,
            is_keyframe,
        }
    }

    /// Junk in front of the first start code is never part of a unit.
    fn skip_to_first_marker(&mut self) {
        let cursor = self.window.read_cursor();
        match extract::find_start_code(self.window.as_slice(), cursor) {
            Some(pos) => {
                self.progress.skipped += (pos - cursor) as u64;
                self.window.advance_to(pos);
            }
            // Keep two bytes: they may be the head of a split marker.
            None => self.progress.skipped += self.window.discard_keep_tail(2) as u64,
        }
    }

    fn drop_oversize_unit(&mut self) {
        let capacity = self.window.capacity();
        let dropped = self.window.discard_keep_tail(2);
        self.progress.skipped += dropped as u64;
        self.oversize_dropped += 1;
        warn!(
            error = %EngineError::UnitTooLarge { capacity },
            dropped_bytes = dropped,
            "Dropping access unit"
        );
    }

    /// Resolve whatever is left in the window after end of input.
    fn finish(&mut self) -> Option<BitstreamPacket> {
        self.finished = true;
        let cursor = self.window.read_cursor();
        let rest = self.window.fill_level() - cursor;
        let tail = extract::scan(self.window.as_slice(), cursor, self.codec, true);
        self.window.advance_to(self.window.fill_level());

        let packet = match tail {
            Extraction::Unit(unit) if unit.is_codable && self.trailing == TrailingUnit::Emit => {
                self.progress.skipped += (unit.start - cursor) as u64;
                self.progress.consumed += unit.len() as u64;
                let data = self.window.as_slice()[unit.start..unit.end].to_vec();
                Some(self.packet(data, unit.is_keyframe))
            }
            Extraction::Unit(unit) => {
                self.trailing_discarded = unit.is_codable;
                debug!(
                    bytes = unit.len(),
                    codable = unit.is_codable,
                    "Discarding unterminated trailing unit"
                );
                self.progress.skipped += rest as u64;
                None
            }
            Extraction::NeedMoreData => {
                self.progress.skipped += rest as u64;
                None
            }
        };

        info!(
            units = self.units,
            bytes_read = self.progress.total_read,
            skipped = self.progress.skipped,
            oversize_dropped = self.oversize_dropped,
            "Access-unit extraction complete"
        );
        packet
    }
}

impl<R: Read + Send> ArtifactSource for AccessUnitReader<R> {
    fn next_input(&mut self) -> Result<Option<Artifact>> {
        Ok(self.next_unit()?.map(Artifact::Packet))
    }
}

/// Open `path` for reading; `-` is standard input.
pub fn open_input(path: &Path) -> Result<Box<dyn Read + Send>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let file = File::open(path)
        .map_err(|e| EngineError::Demux(format!("cannot open {}: {e}", path.display())))?;
    Ok(Box::new(file))
}

#![doc = include_str!("../README.md")]

/// Access-unit boundary scan over a byte window.
pub mod extract;
/// File-based [`hwpipe_core::codec_traits::BitstreamSink`] and per-channel routing.
pub mod file_sink;
/// Raw planar YUV reader and writer.
pub mod raw;
/// Pull-based access-unit reader over any `io::Read`.
pub mod reader;
/// Fixed-capacity sliding byte window.
pub mod window;

pub use extract::{AccessUnit, Extraction, ScanProgress, extract};
pub use file_sink::{ChannelSinks, FileBitstreamSink, channel_output_path};
pub use raw::{RawFrameReader, RawFrameWriter, raw_output_path};
pub use reader::{AccessUnitReader, ReaderStats, TrailingUnit, open_input};
pub use window::{ByteWindow, DEFAULT_WINDOW_CAPACITY};

#![doc = include_str!("../README.md")]

/// Device bookkeeping and the [`hwpipe_core::device::Accelerator`] impl.
pub mod accelerator;
/// Buffering decoder producing deterministic frames.
pub mod decoder;
/// Lookahead encoder emitting parseable Annex-B units.
pub mod encoder;
/// Single-slot stages: scaler and host/device transfers.
pub mod oneshot;

mod util;

pub use accelerator::SimAccelerator;
pub use decoder::SimDecoder;
pub use encoder::SimEncoder;
pub use oneshot::{OneShotStage, Resample, Transfer};

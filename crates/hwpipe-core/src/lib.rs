#![doc = include_str!("../README.md")]

pub mod codec_traits;
pub mod device;
pub mod error;
pub mod params;
pub mod retry;
pub mod stage;
pub mod status;
pub mod types;

pub use error::{EngineError, Result};

//! Stream parameters handed to every stage at init.
//!
//! Tuning options are opaque to the pipeline: it forwards them to the
//! accelerator untouched.  Validation happens once, in
//! [`StreamParams::validate`], when a session is initialised.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{CodecKind, PixelFormat};

/// Longest accepted tuning option name, in bytes.
pub const MAX_OPTION_NAME_LEN: usize = 64;
/// Longest accepted string option value, in bytes.
pub const MAX_STRING_OPTION_LEN: usize = 2048;
/// Most outputs a multi-output scaler or encoder session can carry.
pub const MAX_OUTPUTS: usize = 16;

/// Frame rate as a rational number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }
}

impl Default for FrameRate {
    /// 23.976 fps.
    fn default() -> Self {
        Self::new(24_000, 1_001)
    }
}

// ─── Tuning options ──────────────────────────────────────────────────────────

/// Callback fired by a decoder when the coded picture properties change.
///
/// Receives the new width, height and pixel format.
#[derive(Clone)]
pub struct PropertyCallback(Arc<dyn Fn(u32, u32, PixelFormat) + Send + Sync>);

impl PropertyCallback {
    pub fn new(f: impl Fn(u32, u32, PixelFormat) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, width: u32, height: u32, format: PixelFormat) {
        (self.0)(width, height, format)
    }
}

impl fmt::Debug for PropertyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PropertyCallback(..)")
    }
}

impl PartialEq for PropertyCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Type tag of a tuning option value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Int32,
    Int64,
    String,
    Callback,
}

/// Value of one tuning option.
///
/// Callbacks live in process memory and are never serialised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningValue {
    Int32(i32),
    Int64(i64),
    String(String),
    #[serde(skip)]
    Callback(PropertyCallback),
}

impl TuningValue {
    pub fn type_tag(&self) -> OptionType {
        match self {
            Self::Int32(_) => OptionType::Int32,
            Self::Int64(_) => OptionType::Int64,
            Self::String(_) => OptionType::String,
            Self::Callback(_) => OptionType::Callback,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningOption {
    pub name: String,
    pub value: TuningValue,
}

/// Ordered list of named options, built with the chaining setters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TuningOptions(Vec<TuningOption>);

impl TuningOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int32(mut self, name: &str, value: i32) -> Self {
        self.push(name, TuningValue::Int32(value));
        self
    }

    pub fn int64(mut self, name: &str, value: i64) -> Self {
        self.push(name, TuningValue::Int64(value));
        self
    }

    pub fn string(mut self, name: &str, value: impl Into<String>) -> Self {
        self.push(name, TuningValue::String(value.into()));
        self
    }

    pub fn callback(mut self, name: &str, callback: PropertyCallback) -> Self {
        self.push(name, TuningValue::Callback(callback));
        self
    }

    /// Append an option; a later value with the same name is kept as-is and
    /// rejected by [`TuningOptions::validate`].
    pub fn push(&mut self, name: &str, value: TuningValue) {
        self.0.push(TuningOption {
            name: name.to_string(),
            value,
        });
    }

    pub fn get(&self, name: &str) -> Option<&TuningValue> {
        self.0.iter().find(|o| o.name == name).map(|o| &o.value)
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            TuningValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            TuningValue::Int64(v) => Some(*v),
            TuningValue::Int32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            TuningValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_callback(&self, name: &str) -> Option<&PropertyCallback> {
        match self.get(name)? {
            TuningValue::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TuningOption> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split off callback options, which cannot leave the process.
    pub fn without_callbacks(&self) -> (Self, Vec<String>) {
        let mut dropped = Vec::new();
        let kept = self
            .0
            .iter()
            .filter(|o| {
                let cb = matches!(o.value, TuningValue::Callback(_));
                if cb {
                    dropped.push(o.name.clone());
                }
                !cb
            })
            .cloned()
            .collect();
        (Self(kept), dropped)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for option in &self.0 {
            if option.name.is_empty() {
                return Err(EngineError::InvalidParams("tuning option with empty name".into()));
            }
            if option.name.len() > MAX_OPTION_NAME_LEN {
                return Err(EngineError::InvalidParams(format!(
                    "tuning option name '{}' exceeds {MAX_OPTION_NAME_LEN} bytes",
                    option.name
                )));
            }
            if !seen.insert(option.name.as_str()) {
                return Err(EngineError::InvalidParams(format!(
                    "duplicate tuning option '{}'",
                    option.name
                )));
            }
            if let TuningValue::String(s) = &option.value
                && s.len() > MAX_STRING_OPTION_LEN
            {
                return Err(EngineError::InvalidParams(format!(
                    "string option '{}' is {} bytes, limit is {MAX_STRING_OPTION_LEN}",
                    option.name,
                    s.len()
                )));
            }
        }
        Ok(())
    }
}

// ─── Output ladder ───────────────────────────────────────────────────────────

/// One rendition of a multi-output scaler/encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub width: u32,
    pub height: u32,
    /// Target bitrate for the encoder channel of this rung.
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Codec of the encoder channel of this rung.
    #[serde(default)]
    pub codec: Option<CodecKind>,
}

impl OutputSpec {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bitrate_kbps: None,
            codec: None,
        }
    }

    pub const fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    pub const fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = Some(codec);
        self
    }
}

// ─── StreamParams ────────────────────────────────────────────────────────────

/// Everything a stage needs to know about the stream at init.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: PixelFormat,
    #[serde(default)]
    pub fps: FrameRate,
    /// Bitstream codec for decode/encode sessions.
    #[serde(default)]
    pub codec: Option<CodecKind>,
    /// Rendition ladder; empty means a single output matching the input.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub options: TuningOptions,
}

impl StreamParams {
    pub fn builder(width: u32, height: u32) -> StreamParamsBuilder {
        StreamParamsBuilder {
            params: Self {
                width,
                height,
                format: PixelFormat::default(),
                fps: FrameRate::default(),
                codec: None,
                outputs: Vec::new(),
                options: TuningOptions::default(),
            },
        }
    }

    /// Output geometry per rung, falling back to the input size.
    pub fn effective_outputs(&self) -> Vec<OutputSpec> {
        if self.outputs.is_empty() {
            vec![OutputSpec {
                codec: self.codec,
                ..OutputSpec::new(self.width, self.height)
            }]
        } else {
            self.outputs.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidParams(format!(
                "geometry must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps.num == 0 || self.fps.den == 0 {
            return Err(EngineError::InvalidParams(format!(
                "frame rate {}/{} is not usable",
                self.fps.num, self.fps.den
            )));
        }
        if self.outputs.len() > MAX_OUTPUTS {
            return Err(EngineError::InvalidParams(format!(
                "{} outputs requested, at most {MAX_OUTPUTS} are supported",
                self.outputs.len()
            )));
        }
        for (i, out) in self.outputs.iter().enumerate() {
            if out.width == 0 || out.height == 0 {
                return Err(EngineError::InvalidParams(format!(
                    "output {i} has empty geometry {}x{}",
                    out.width, out.height
                )));
            }
        }
        self.options.validate()
    }
}

/// Builder for [`StreamParams`]; `build` validates.
#[derive(Clone, Debug)]
pub struct StreamParamsBuilder {
    params: StreamParams,
}

impl StreamParamsBuilder {
    pub fn format(mut self, format: PixelFormat) -> Self {
        self.params.format = format;
        self
    }

    pub fn fps(mut self, num: u32, den: u32) -> Self {
        self.params.fps = FrameRate::new(num, den);
        self
    }

    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.params.codec = Some(codec);
        self
    }

    pub fn output(mut self, output: OutputSpec) -> Self {
        self.params.outputs.push(output);
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = OutputSpec>) -> Self {
        self.params.outputs.extend(outputs);
        self
    }

    pub fn options(mut self, options: TuningOptions) -> Self {
        self.params.options = options;
        self
    }

    pub fn build(self) -> Result<StreamParams> {
        self.params.validate()?;
        Ok(self.params)
    }
}

// ─── Presets ─────────────────────────────────────────────────────────────────

/// Option sets matching the reference sample configuration.
pub mod presets {
    use super::{OutputSpec, PropertyCallback, TuningOptions};
    use crate::types::{CodecKind, PixelFormat};

    /// Output format code passed as the decoder's `out_fmt`.
    pub const fn format_code(format: PixelFormat) -> i32 {
        match format {
            PixelFormat::Yuv420p => 0,
            PixelFormat::Nv12 => 1,
            PixelFormat::Yuv420p10le => 2,
        }
    }

    pub fn decoder(format: PixelFormat, on_change: PropertyCallback) -> TuningOptions {
        TuningOptions::new()
            .int32("low_latency", 0)
            .callback("prop_change_callback", on_change)
            .int32("latency_logging", 1)
            .int32("out_fmt", format_code(format))
    }

    pub fn scaler() -> TuningOptions {
        TuningOptions::new().int32("latency_logging", 1)
    }

    pub fn encoder() -> TuningOptions {
        TuningOptions::new()
            .int32("slice", -1)
            .int32("cores", 1)
            .int32("spatial_aq", -1)
            .int32("temporal_aq", -1)
            .int32("latency_logging", 0)
            .int32("tune_metrics", 1)
            .int32("qp_mode", 0)
            .int32("forced_idr", 1)
            .int32("crf", 0)
            .int64("max_bitrate", -1)
            .int32("bf", -1)
            .int32("dynamic_gop", -1)
            .int32("latency_ms", -1)
            .int32("bufsize", -1)
            .string("expert_options", "")
    }

    /// Four-rung ABR ladder used by the transcode flow.
    pub fn abr_ladder() -> Vec<OutputSpec> {
        vec![
            OutputSpec::new(1280, 720)
                .with_bitrate(5_000)
                .with_codec(CodecKind::H264),
            OutputSpec::new(720, 480)
                .with_bitrate(3_000)
                .with_codec(CodecKind::Hevc),
            OutputSpec::new(480, 360)
                .with_bitrate(2_000)
                .with_codec(CodecKind::H264),
            OutputSpec::new(288, 160)
                .with_bitrate(1_000)
                .with_codec(CodecKind::H264),
        ]
    }
}

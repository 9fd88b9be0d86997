//! CLI/runtime bridge helpers.
//!
//! Turns a request (geometry, codec, device) plus a [`StageGraph`] into
//! per-stage [`StreamParams`], opens the device and sessions on any
//! [`Accelerator`], runs the orchestrator, and tears everything down in
//! reverse acquisition order.  Callers never touch sessions directly.

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use hwpipe_bitstream::{
    AccessUnitReader, ChannelSinks, RawFrameReader, RawFrameWriter, TrailingUnit, open_input,
    raw_output_path,
};
use hwpipe_core::codec_traits::{ArtifactSink, ArtifactSource};
use hwpipe_core::device::{Accelerator, DeviceHandle};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::{
    FrameRate, OutputSpec, PropertyCallback, StreamParams, TuningOptions, presets,
};
use hwpipe_core::retry::{RetryPolicy, RetryingStage};
use hwpipe_core::stage::{StageRole, StageSession};
use hwpipe_core::status::StepStatus;
use hwpipe_core::types::{CodecKind, PixelFormat};

use crate::pipeline::{Orchestrator, PipelineConfig, PipelineReport};
use crate::stage_graph::{StageGraph, merge_options};

pub fn parse_codec(s: &str) -> Result<CodecKind> {
    if let Ok(selector) = s.parse::<u32>() {
        return CodecKind::from_selector(selector).ok_or_else(|| {
            EngineError::Pipeline(format!(
                "Unknown codec selector {selector}. Use {} (h264) or {} (hevc).",
                CodecKind::H264.selector(),
                CodecKind::Hevc.selector()
            ))
        });
    }
    match s.to_ascii_lowercase().as_str() {
        "hevc" | "h265" | "265" => Ok(CodecKind::Hevc),
        "h264" | "264" | "avc" => Ok(CodecKind::H264),
        other => Err(EngineError::Pipeline(format!(
            "Unknown codec '{other}'. Use hevc or h264."
        ))),
    }
}

/// Stream description supplied by the caller.
#[derive(Clone, Debug)]
pub struct RuntimeRequest {
    pub device: u32,
    pub codec: Option<CodecKind>,
    pub width: u32,
    pub height: u32,
    pub fps: FrameRate,
    pub format: PixelFormat,
}

impl RuntimeRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            device: 0,
            codec: None,
            width,
            height,
            fps: FrameRate::default(),
            format: PixelFormat::default(),
        }
    }
}

/// Resolved init arguments for one stage.
#[derive(Clone, Debug)]
pub struct StagePlan {
    pub role: StageRole,
    pub params: StreamParams,
    pub retry: RetryPolicy,
}

fn preset_options(role: StageRole, format: PixelFormat) -> TuningOptions {
    match role {
        StageRole::Decode => presets::decoder(
            format,
            PropertyCallback::new(|width, height, format| {
                info!(width, height, ?format, "Decoder stream properties");
            }),
        ),
        StageRole::Scale => presets::scaler(),
        StageRole::Encode => presets::encoder(),
        StageRole::Upload | StageRole::Download => TuningOptions::new(),
    }
}

/// Resolve every stage's [`StreamParams`].
///
/// Geometry follows the chain: a scaler's ladder becomes the input of
/// whatever comes next, and an encoder without its own outputs encodes
/// that ladder.
pub fn plan_stages(request: &RuntimeRequest, graph: &StageGraph) -> Result<Vec<StagePlan>> {
    graph.validate()?;
    let mut flowing = vec![OutputSpec::new(request.width, request.height)];
    let mut plans = Vec::with_capacity(graph.stages.len());

    for stage in &graph.stages {
        let role = stage.kind;
        let needs_codec = matches!(role, StageRole::Decode | StageRole::Encode);
        if needs_codec && request.codec.is_none() {
            return Err(EngineError::InvalidParams(format!("{role} stage needs a codec")));
        }
        let input = flowing[0];
        let outputs = match role {
            StageRole::Scale if !stage.outputs.is_empty() => stage.outputs.clone(),
            StageRole::Encode if !stage.outputs.is_empty() => stage.outputs.clone(),
            StageRole::Encode if flowing.len() > 1 => flowing.clone(),
            _ => Vec::new(),
        };
        let options = merge_options(&preset_options(role, request.format), &stage.options);

        let mut builder = StreamParams::builder(input.width, input.height)
            .format(request.format)
            .fps(request.fps.num, request.fps.den)
            .outputs(outputs)
            .options(options);
        if let Some(codec) = request.codec {
            builder = builder.codec(codec);
        }
        let params = builder.build().map_err(|err| {
            EngineError::InvalidParams(format!("{role} stage: {err}"))
        })?;

        if role == StageRole::Scale {
            flowing = params.effective_outputs();
        }
        plans.push(StagePlan {
            role,
            params,
            retry: stage.retry_policy(),
        });
    }
    Ok(plans)
}

/// Codec of each encoder channel, in channel order; empty when the chain
/// does not end in an encoder.
pub fn channel_codecs(plans: &[StagePlan]) -> Vec<CodecKind> {
    match plans.last() {
        Some(plan) if plan.role == StageRole::Encode => plan
            .params
            .effective_outputs()
            .iter()
            .filter_map(|out| out.codec.or(plan.params.codec))
            .collect(),
        _ => Vec::new(),
    }
}

// ─── Sources and sinks ───────────────────────────────────────────────────────

/// Access units from an Annex-B file, `-` for stdin.
pub fn packet_source(
    path: &Path,
    codec: CodecKind,
    trailing: TrailingUnit,
) -> Result<AccessUnitReader<Box<dyn Read + Send>>> {
    Ok(AccessUnitReader::new(open_input(path)?, codec).trailing_unit(trailing))
}

/// Raw frames of the request's geometry, `-` for stdin.
pub fn raw_source(
    path: &Path,
    request: &RuntimeRequest,
) -> Result<RawFrameReader<Box<dyn Read + Send>>> {
    Ok(RawFrameReader::new(
        open_input(path)?,
        request.width,
        request.height,
        request.format,
    ))
}

/// Raw YUV writer on `<prefix>_0.yuv`, or stdout for `-`.
pub fn raw_sink(prefix: &str) -> Result<Box<dyn ArtifactSink>> {
    if prefix == "-" {
        return Ok(Box::new(RawFrameWriter::new(io::stdout(), "stdout")));
    }
    Ok(Box::new(RawFrameWriter::create(&raw_output_path(prefix))?))
}

/// One bitstream file per encoder channel.  With `-`, channel 0 goes to
/// stdout and the other channels are discarded.
pub fn encoded_sinks(prefix: &str, codecs: &[CodecKind]) -> Result<ChannelSinks> {
    if prefix != "-" {
        return ChannelSinks::create_files(prefix, codecs);
    }
    if codecs.len() > 1 {
        warn!(
            discarded = codecs.len() - 1,
            "Writing channel 0 to stdout, other channels are discarded"
        );
    }
    Ok(ChannelSinks::stdout(codecs.len()))
}

// ─── Stage stack ─────────────────────────────────────────────────────────────

/// A device and the sessions opened on it, in acquisition order.
///
/// Closing happens in reverse: sessions last-to-first, then the device.
/// [`StageStack::teardown`] is idempotent and `Drop` runs it as a fallback.
pub struct StageStack {
    accel: Arc<dyn Accelerator>,
    device: Option<DeviceHandle>,
    sessions: Vec<Box<dyn StageSession>>,
}

impl StageStack {
    /// Open the device and every stage of `plans`.
    ///
    /// On failure whatever was already opened is closed again before the
    /// error is returned.
    pub fn open(
        accel: Arc<dyn Accelerator>,
        device_index: u32,
        plans: &[StagePlan],
    ) -> std::result::Result<Self, (EngineError, StepStatus)> {
        let device = accel
            .open_device(device_index)
            .map_err(|err| {
                let status = StepStatus::for_error(&err);
                (err, status)
            })?;
        let mut stack = Self {
            accel,
            device: Some(device),
            sessions: Vec::with_capacity(plans.len()),
        };
        for plan in plans {
            match stack.accel.init_stage(device, plan.role, &plan.params) {
                Ok(session) => {
                    debug!(role = %plan.role, retry = ?plan.retry, "Stage ready");
                    let retrying: Box<dyn StageSession> =
                        Box::new(RetryingStage::new(session, plan.retry));
                    stack.sessions.push(retrying);
                }
                Err(err) => {
                    error!(role = %plan.role, code = err.error_code(), error = %err, "Stage init failed");
                    let status = StepStatus::for_error(&err) | stack.teardown();
                    return Err((err, status));
                }
            }
        }
        info!(
            accelerator = stack.accel.name(),
            %device,
            stages = stack.sessions.len(),
            "Stage stack opened"
        );
        Ok(stack)
    }

    pub fn roles(&self) -> Vec<StageRole> {
        self.sessions.iter().map(|s| s.role()).collect()
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    /// Drive the orchestrator over the open sessions.
    pub fn run(
        &mut self,
        config: PipelineConfig,
        source: &mut dyn ArtifactSource,
        sink: &mut dyn ArtifactSink,
    ) -> Result<PipelineReport> {
        let mut orchestrator = Orchestrator::new(config, &self.roles());
        orchestrator.run(&mut self.sessions, source, sink)
    }

    /// Close sessions in reverse order, then the device.  Returns the status
    /// bits of every close that failed.
    pub fn teardown(&mut self) -> StepStatus {
        let mut status = StepStatus::OK;
        while let Some(mut session) = self.sessions.pop() {
            let role = session.role();
            if let Err(err) = session.close() {
                warn!(%role, error = %err, "Session close failed");
                status |= StepStatus::for_role(role);
            }
        }
        if let Some(device) = self.device.take() {
            match self.accel.close_device(device) {
                Ok(()) => debug!(%device, "Device closed"),
                Err(err) => {
                    warn!(%device, error = %err, "Device close failed");
                    status |= StepStatus::DEVICE;
                }
            }
        }
        status
    }
}

impl Drop for StageStack {
    fn drop(&mut self) {
        if self.device.is_some() || !self.sessions.is_empty() {
            let _ = self.teardown();
        }
    }
}

// ─── One-shot run ────────────────────────────────────────────────────────────

/// Everything the CLI needs to report and pick an exit status.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Option<PipelineReport>,
    pub status: StepStatus,
    pub error: Option<EngineError>,
}

/// Open, run and tear down one pipeline.
pub fn run_pipeline(
    accel: Arc<dyn Accelerator>,
    request: &RuntimeRequest,
    plans: &[StagePlan],
    config: PipelineConfig,
    source: &mut dyn ArtifactSource,
    sink: &mut dyn ArtifactSink,
) -> RunOutcome {
    let mut stack = match StageStack::open(accel, request.device, plans) {
        Ok(stack) => stack,
        Err((err, status)) => {
            return RunOutcome {
                report: None,
                status,
                error: Some(err),
            };
        }
    };

    let result = stack.run(config, source, sink);
    let mut status = stack.teardown();
    match result {
        Ok(report) => RunOutcome {
            report: Some(report),
            status,
            error: None,
        },
        Err(err) => {
            status |= StepStatus::for_error(&err);
            RunOutcome {
                report: None,
                status,
                error: Some(err),
            }
        }
    }
}

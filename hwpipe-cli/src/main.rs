//! hwpipe CLI entrypoint.
//!
//! ```bash
//! hwpipe decode in.h264 h264 out 1920 1080 24000 1001
//! hwpipe encode in.yuv hevc out 1920 1080
//! hwpipe transcode in.h264 h264 ladder 1920 1080 --json
//! hwpipe transcode in.h264 h264 ladder 1920 1080 --remote 127.0.0.1:7070 --transfer copy
//! hwpipe serve --listen 127.0.0.1:7070
//! hwpipe graph --graph graph.json
//! ```

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

use hwpipe_bitstream::{ReaderStats, TrailingUnit};
use hwpipe_core::codec_traits::{ArtifactSink, ArtifactSource};
use hwpipe_core::device::Accelerator;
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::FrameRate;
use hwpipe_core::status::StepStatus;
use hwpipe_core::types::PixelFormat;
use hwpipe_pipeline::runtime::{
    channel_codecs, encoded_sinks, packet_source, parse_codec, raw_sink, raw_source,
};
use hwpipe_pipeline::stage_graph::Shape;
use hwpipe_pipeline::{
    PipelineConfig, PipelineReport, RuntimeRequest, StageGraph, plan_stages, run_pipeline,
};
use hwpipe_remote::{RemoteAccelerator, StageServer, TransferMode};
use hwpipe_sim::SimAccelerator;

#[derive(Parser, Debug)]
#[command(
    name = "hwpipe",
    version,
    about = "Hardware-accelerated video pipeline host",
    arg_required_else_help = true,
    after_help = "Examples:\n  hwpipe decode in.h264 h264 out 1920 1080 24000 1001\n  hwpipe encode in.yuv hevc out 1920 1080\n  hwpipe transcode in.h264 h264 ladder 1920 1080 --json\n  hwpipe serve --listen 127.0.0.1:7070\n  hwpipe graph --graph graph.json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode an Annex-B stream to raw planar YUV (decode → download).
    Decode(DecodeArgs),
    /// Encode raw planar YUV to an Annex-B stream (upload → encode).
    Encode(EncodeArgs),
    /// Decode, scale to the ABR ladder and encode every rung.
    Transcode(TranscodeArgs),
    /// Host the simulated accelerator for remote clients until Ctrl-C.
    Serve(ServeArgs),
    /// Validate a stage graph file and print the resolved chain.
    Graph(GraphArgs),
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Input file, `-` for stdin.
    input: PathBuf,
    /// Codec: h264, hevc, or a numeric selector.
    codec: String,
    /// Output prefix, `-` for stdout.
    output: String,
    width: u32,
    height: u32,
}

#[derive(Args, Debug)]
struct SharedArgs {
    /// Device ordinal.
    #[arg(short = 'd', long = "device", default_value_t = 0)]
    device: u32,

    /// Stage graph JSON overriding the built-in chain.
    #[arg(long = "graph")]
    graph: Option<PathBuf>,

    /// Run the stages on a remote stage server.
    #[arg(long = "remote")]
    remote: Option<SocketAddr>,

    /// How device frames cross the remote connection.
    #[arg(long = "transfer", value_enum, default_value_t = TransferArg::Handle, requires = "remote")]
    transfer: TransferArg,

    /// Policy for a final access unit with no closing marker.
    #[arg(long = "trailing-unit", value_enum, default_value_t = TrailingArg::Discard)]
    trailing_unit: TrailingArg,

    /// Bound on polls per flush phase (overrides the graph).
    #[arg(long = "max-flush-polls")]
    max_flush_polls: Option<u32>,

    /// Fail the run when the metrics duplication check fails.
    #[arg(long = "strict-invariants", default_value_t = false)]
    strict_invariants: bool,

    /// Emit one JSON report line on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    #[command(flatten)]
    stream: StreamArgs,
    fps_num: u32,
    fps_den: u32,
    /// Decoder output layout.
    #[arg(long = "pix-fmt", value_enum, default_value_t = PixFmtArg::Yuv420p)]
    pix_fmt: PixFmtArg,
    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args, Debug)]
struct EncodeArgs {
    #[command(flatten)]
    stream: StreamArgs,
    #[arg(requires = "fps_den")]
    fps_num: Option<u32>,
    fps_den: Option<u32>,
    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args, Debug)]
struct TranscodeArgs {
    #[command(flatten)]
    stream: StreamArgs,
    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long = "listen", default_value = "127.0.0.1:7070")]
    listen: SocketAddr,
    /// Number of simulated devices.
    #[arg(long = "devices", default_value_t = hwpipe_sim::accelerator::DEFAULT_DEVICE_COUNT)]
    devices: u32,
}

#[derive(Args, Debug)]
struct GraphArgs {
    #[arg(long = "graph")]
    graph: PathBuf,
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransferArg {
    Handle,
    Copy,
}

impl From<TransferArg> for TransferMode {
    fn from(arg: TransferArg) -> Self {
        match arg {
            TransferArg::Handle => TransferMode::Handle,
            TransferArg::Copy => TransferMode::Copy,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TrailingArg {
    Discard,
    Emit,
}

impl From<TrailingArg> for TrailingUnit {
    fn from(arg: TrailingArg) -> Self {
        match arg {
            TrailingArg::Discard => TrailingUnit::Discard,
            TrailingArg::Emit => TrailingUnit::Emit,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PixFmtArg {
    Yuv420p,
    Nv12,
    Yuv420p10le,
}

impl From<PixFmtArg> for PixelFormat {
    fn from(arg: PixFmtArg) -> Self {
        match arg {
            PixFmtArg::Yuv420p => PixelFormat::Yuv420p,
            PixFmtArg::Nv12 => PixelFormat::Nv12,
            PixFmtArg::Yuv420p10le => PixelFormat::Yuv420p10le,
        }
    }
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Decode(args) => {
            let flow = Flow {
                name: "decode",
                graph: StageGraph::decode_flow(),
                input: Shape::Packet,
                output: Shape::HostFrame,
            };
            let fps = FrameRate::new(args.fps_num, args.fps_den);
            run_flow(flow, &args.stream, &args.shared, fps, args.pix_fmt.into())
        }
        Commands::Encode(args) => {
            let flow = Flow {
                name: "encode",
                graph: StageGraph::encode_flow(),
                input: Shape::HostFrame,
                output: Shape::Encoded,
            };
            let fps = match (args.fps_num, args.fps_den) {
                (Some(num), Some(den)) => FrameRate::new(num, den),
                _ => FrameRate::default(),
            };
            run_flow(flow, &args.stream, &args.shared, fps, PixelFormat::Yuv420p)
        }
        Commands::Transcode(args) => {
            let flow = Flow {
                name: "transcode",
                graph: StageGraph::transcode_flow(),
                input: Shape::Packet,
                output: Shape::Encoded,
            };
            run_flow(
                flow,
                &args.stream,
                &args.shared,
                FrameRate::default(),
                PixelFormat::Yuv420p,
            )
        }
        Commands::Serve(args) => run_serve(args),
        Commands::Graph(args) => run_graph(args),
    };
    std::process::exit(code);
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

// ─── Pipeline flows ──────────────────────────────────────────────────────────

struct Flow {
    name: &'static str,
    graph: StageGraph,
    input: Shape,
    output: Shape,
}

/// A failed step and the status bit it maps to.
struct Failure {
    status: StepStatus,
    error: EngineError,
}

impl Failure {
    fn at(status: StepStatus) -> impl FnOnce(EngineError) -> Self {
        move |error| Self { status, error }
    }
}

fn run_flow(
    flow: Flow,
    stream: &StreamArgs,
    shared: &SharedArgs,
    fps: FrameRate,
    format: PixelFormat,
) -> i32 {
    let json_output = shared.json && stream.output != "-";
    if shared.json && !json_output {
        tracing::warn!("--json ignored while stdout carries the output stream");
    }
    match execute_flow(&flow, stream, shared, fps, format) {
        Ok((report, status, input)) => {
            if json_output {
                println!("{}", flow_json(flow.name, &report, status, input.as_ref()));
            }
            i32::from(status.bits())
        }
        Err(failure) => {
            tracing::error!(
                command = flow.name,
                code = failure.error.error_code(),
                error = %failure.error,
                "Command failed"
            );
            if json_output {
                println!(
                    "{}",
                    command_error_json(flow.name, &failure.error.to_string(), failure.status)
                );
            }
            i32::from(failure.status.bits())
        }
    }
}

fn load_graph(flow: &Flow, shared: &SharedArgs) -> Result<StageGraph> {
    let graph = match &shared.graph {
        Some(path) => StageGraph::from_json_file(path)?,
        None => flow.graph.clone(),
    };
    graph.validate()?;
    if graph.input_shape() != Some(flow.input) || graph.output_shape() != Some(flow.output) {
        return Err(EngineError::InvariantViolation(format!(
            "{} needs a graph from {} to {}, got {}",
            flow.name,
            flow.input.label(),
            flow.output.label(),
            graph
                .roles()
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        )));
    }
    Ok(graph)
}

fn connect(shared: &SharedArgs) -> Result<Arc<dyn Accelerator>> {
    match shared.remote {
        Some(addr) => Ok(Arc::new(RemoteAccelerator::connect(
            addr,
            shared.transfer.into(),
        )?)),
        None => Ok(Arc::new(SimAccelerator::new())),
    }
}

type FlowSuccess = (PipelineReport, StepStatus, Option<ReaderStats>);

fn execute_flow(
    flow: &Flow,
    stream: &StreamArgs,
    shared: &SharedArgs,
    fps: FrameRate,
    format: PixelFormat,
) -> std::result::Result<FlowSuccess, Failure> {
    let input = Failure::at(StepStatus::INPUT);
    let codec = parse_codec(&stream.codec).map_err(input)?;
    let graph = load_graph(flow, shared).map_err(Failure::at(StepStatus::INPUT))?;
    let request = RuntimeRequest {
        device: shared.device,
        codec: Some(codec),
        width: stream.width,
        height: stream.height,
        fps,
        format,
    };
    let plans = plan_stages(&request, &graph).map_err(Failure::at(StepStatus::INPUT))?;
    let config = PipelineConfig {
        max_flush_polls: shared
            .max_flush_polls
            .or(graph.max_flush_polls)
            .unwrap_or(PipelineConfig::default().max_flush_polls),
        strict_invariants: shared.strict_invariants,
    };

    let mut sink: Box<dyn ArtifactSink> = match flow.output {
        Shape::Encoded => Box::new(
            encoded_sinks(&stream.output, &channel_codecs(&plans))
                .map_err(Failure::at(StepStatus::PROCESSING))?,
        ),
        _ => raw_sink(&stream.output).map_err(Failure::at(StepStatus::PROCESSING))?,
    };
    let accel = connect(shared).map_err(Failure::at(StepStatus::DEVICE))?;

    let (outcome, stats) = match flow.input {
        Shape::Packet => {
            let mut source = packet_source(&stream.input, codec, shared.trailing_unit.into())
                .map_err(Failure::at(StepStatus::INPUT))?;
            let outcome = run_pipeline(accel, &request, &plans, config, &mut source, sink.as_mut());
            (outcome, Some(source.stats()))
        }
        _ => {
            let mut source: Box<dyn ArtifactSource> = Box::new(
                raw_source(&stream.input, &request).map_err(Failure::at(StepStatus::INPUT))?,
            );
            let outcome =
                run_pipeline(accel, &request, &plans, config, source.as_mut(), sink.as_mut());
            (outcome, None)
        }
    };

    match (outcome.report, outcome.error) {
        (Some(report), None) => Ok((report, outcome.status, stats)),
        (_, Some(error)) => Err(Failure {
            status: outcome.status,
            error,
        }),
        (None, None) => Err(Failure {
            status: outcome.status | StepStatus::PROCESSING,
            error: EngineError::Pipeline("run ended without a report".into()),
        }),
    }
}

// ─── serve / graph ───────────────────────────────────────────────────────────

fn run_serve(args: ServeArgs) -> i32 {
    let rt = match build_runtime() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(error = %err, "Failed to build tokio runtime");
            return i32::from(StepStatus::PROCESSING.bits());
        }
    };
    let result = rt.block_on(async {
        let accel = Arc::new(SimAccelerator::new().with_device_count(args.devices));
        let server = StageServer::bind(args.listen, accel).await?;
        let stop = server.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received");
            }
            stop.cancel();
        });
        server.serve().await
    });
    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, listen = %args.listen, "Stage server failed");
            i32::from(StepStatus::DEVICE.bits())
        }
    }
}

fn run_graph(args: GraphArgs) -> i32 {
    let graph = StageGraph::from_json_file(&args.graph).and_then(|g| g.validate().map(|()| g));
    match graph {
        Ok(graph) => {
            if args.json {
                let value = json!({
                    "schema_version": JSON_SCHEMA_VERSION,
                    "command": "graph",
                    "ok": true,
                    "graph_schema_version": graph.graph_schema_version,
                    "stages": graph.roles(),
                    "input": graph.input_shape(),
                    "output": graph.output_shape(),
                    "max_flush_polls": graph.max_flush_polls,
                });
                println!("{value}");
            } else {
                for (i, line) in graph.describe().iter().enumerate() {
                    println!("{i}: {line}");
                }
            }
            0
        }
        Err(err) => {
            tracing::error!(error = %err, code = err.error_code(), "Command failed");
            if args.json {
                println!("{}", command_error_json("graph", &err.to_string(), StepStatus::INPUT));
            }
            i32::from(StepStatus::INPUT.bits())
        }
    }
}

// ─── JSON output ─────────────────────────────────────────────────────────────

fn flow_json(
    command: &str,
    report: &PipelineReport,
    status: StepStatus,
    input: Option<&ReaderStats>,
) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": status.is_ok(),
        "status": status.bits(),
        "report": report,
        "input": input,
    })
}

fn command_error_json(command: &str, error: &str, status: StepStatus) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "status": status.bits(),
        "error": error,
    })
}

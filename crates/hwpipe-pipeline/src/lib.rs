#![doc = include_str!("../README.md")]

pub mod pipeline;
pub mod runtime;
pub mod stage_graph;

pub use pipeline::{
    Orchestrator, PipelineConfig, PipelineMetrics, PipelinePhase, PipelineReport, PipelineState,
};
pub use runtime::{RunOutcome, RuntimeRequest, StagePlan, StageStack, plan_stages, run_pipeline};
pub use stage_graph::{GRAPH_SCHEMA_VERSION, StageConfig, StageGraph};

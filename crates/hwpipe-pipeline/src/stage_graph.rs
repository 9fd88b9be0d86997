//! JSON stage graph: which stages run, in what order, with which retry
//! bounds, tuning options and output ladder.

use std::path::Path;

use serde::{Deserialize, Serialize};

use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::{MAX_OUTPUTS, OutputSpec, TuningOptions, presets};
use hwpipe_core::retry::RetryPolicy;
use hwpipe_core::stage::StageRole;

pub const GRAPH_SCHEMA_VERSION: u32 = 1;

/// What flows between two stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Packet,
    HostFrame,
    DeviceFrame,
    Encoded,
}

impl Shape {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Packet => "packet",
            Self::HostFrame => "host frame",
            Self::DeviceFrame => "device frame",
            Self::Encoded => "encoded",
        }
    }

    /// `(input, output)` of a role.
    pub const fn of(role: StageRole) -> (Self, Self) {
        match role {
            StageRole::Decode => (Self::Packet, Self::DeviceFrame),
            StageRole::Scale => (Self::DeviceFrame, Self::DeviceFrame),
            StageRole::Upload => (Self::HostFrame, Self::DeviceFrame),
            StageRole::Download => (Self::DeviceFrame, Self::HostFrame),
            StageRole::Encode => (Self::DeviceFrame, Self::Encoded),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: StageRole,
    /// Overrides the role's default [`RetryPolicy`].
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Merged over the role's preset options; same-name entries win.
    #[serde(default)]
    pub options: TuningOptions,
    /// Output ladder for scale/encode stages.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl StageConfig {
    pub fn new(kind: StageRole) -> Self {
        Self {
            kind,
            retry: None,
            options: TuningOptions::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or(RetryPolicy::for_role(self.kind))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageGraph {
    pub graph_schema_version: u32,
    pub stages: Vec<StageConfig>,
    /// Overrides [`crate::pipeline::PipelineConfig::max_flush_polls`].
    #[serde(default)]
    pub max_flush_polls: Option<u32>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self {
            graph_schema_version: GRAPH_SCHEMA_VERSION,
            stages: Vec::new(),
            max_flush_polls: None,
        }
    }
}

impl StageGraph {
    fn chain(roles: impl IntoIterator<Item = StageConfig>) -> Self {
        Self {
            stages: roles.into_iter().collect(),
            ..Self::default()
        }
    }

    /// decode → download.
    pub fn decode_flow() -> Self {
        Self::chain([
            StageConfig::new(StageRole::Decode),
            StageConfig::new(StageRole::Download),
        ])
    }

    /// upload → encode.
    pub fn encode_flow() -> Self {
        Self::chain([
            StageConfig::new(StageRole::Upload),
            StageConfig::new(StageRole::Encode),
        ])
    }

    /// decode → scale → encode over the default ABR ladder.
    pub fn transcode_flow() -> Self {
        Self::chain([
            StageConfig::new(StageRole::Decode),
            StageConfig::new(StageRole::Scale).with_outputs(presets::abr_ladder()),
            StageConfig::new(StageRole::Encode).with_outputs(presets::abr_ladder()),
        ])
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data).map_err(|err| {
            EngineError::InvariantViolation(format!("Invalid stage graph JSON: {err}"))
        })?;

        let Some(version_value) = value.get("graph_schema_version") else {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {GRAPH_SCHEMA_VERSION}, got missing"
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {GRAPH_SCHEMA_VERSION}, got non-integer"
            )));
        };
        if version != u64::from(GRAPH_SCHEMA_VERSION) {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {GRAPH_SCHEMA_VERSION}, got {version}"
            )));
        }

        serde_json::from_value(value).map_err(|err| {
            EngineError::InvariantViolation(format!("Invalid stage graph JSON: {err}"))
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::InvariantViolation(format!(
                "Failed to read stage graph from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn roles(&self) -> Vec<StageRole> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// What the first stage consumes.
    pub fn input_shape(&self) -> Option<Shape> {
        self.stages.first().map(|s| Shape::of(s.kind).0)
    }

    /// What the last stage produces.
    pub fn output_shape(&self) -> Option<Shape> {
        self.stages.last().map(|s| Shape::of(s.kind).1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.graph_schema_version != GRAPH_SCHEMA_VERSION {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {GRAPH_SCHEMA_VERSION}, got {}",
                self.graph_schema_version
            )));
        }
        if self.stages.is_empty() {
            return Err(EngineError::InvariantViolation(
                "StageGraph validation failed: at least one stage is required".into(),
            ));
        }
        if self.max_flush_polls == Some(0) {
            return Err(EngineError::InvariantViolation(
                "StageGraph validation failed: max_flush_polls must be > 0".into(),
            ));
        }

        for (i, stage) in self.stages.iter().enumerate() {
            if let Some(retry) = &stage.retry {
                retry.validate().map_err(|err| {
                    EngineError::InvariantViolation(format!(
                        "StageGraph validation failed: stage {i} {}: {err}",
                        stage.kind
                    ))
                })?;
            }
            stage.options.validate().map_err(|err| {
                EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: stage {i} {}: {err}",
                    stage.kind
                ))
            })?;
            if !stage.outputs.is_empty()
                && !matches!(stage.kind, StageRole::Scale | StageRole::Encode)
            {
                return Err(EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: stage {i} {} does not take outputs",
                    stage.kind
                )));
            }
            if stage.outputs.len() > MAX_OUTPUTS {
                return Err(EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: stage {i} {} has {} outputs, at most {MAX_OUTPUTS}",
                    stage.kind,
                    stage.outputs.len()
                )));
            }
            if let Some(out) = stage.outputs.iter().find(|o| o.width == 0 || o.height == 0) {
                return Err(EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: stage {i} {} has a {}x{} output",
                    stage.kind, out.width, out.height
                )));
            }
        }

        for (i, pair) in self.stages.windows(2).enumerate() {
            let produced = Shape::of(pair[0].kind).1;
            let wanted = Shape::of(pair[1].kind).0;
            if produced != wanted {
                return Err(EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: stage {i} {} produces {} but stage {} {} consumes {}",
                    pair[0].kind,
                    produced.label(),
                    i + 1,
                    pair[1].kind,
                    wanted.label()
                )));
            }
        }

        // A ladder must be carried through unchanged to the encoder.
        let ladders: Vec<&Vec<OutputSpec>> = self
            .stages
            .iter()
            .filter(|s| s.kind == StageRole::Scale && !s.outputs.is_empty())
            .map(|s| &s.outputs)
            .collect();
        if let (Some(scaled), Some(encode)) = (
            ladders.last(),
            self.stages.iter().find(|s| s.kind == StageRole::Encode),
        ) && !encode.outputs.is_empty()
            && encode.outputs.len() != scaled.len()
        {
            return Err(EngineError::InvariantViolation(format!(
                "StageGraph validation failed: encoder has {} outputs but the scaler emits {}",
                encode.outputs.len(),
                scaled.len()
            )));
        }

        Ok(())
    }

    /// One line per stage, for `hwpipe graph`.
    pub fn describe(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|s| {
                let retry = s.retry_policy();
                let outputs: Vec<String> = s
                    .outputs
                    .iter()
                    .map(|o| format!("{}x{}", o.width, o.height))
                    .collect();
                format!(
                    "{} (send {}, receive {}, backoff {}us, {} options{})",
                    s.kind,
                    retry.send_attempts,
                    retry.recv_attempts,
                    retry.backoff.as_micros(),
                    s.options.len(),
                    if outputs.is_empty() {
                        String::new()
                    } else {
                        format!(", outputs {}", outputs.join(" "))
                    }
                )
            })
            .collect()
    }
}

/// `base` with every option of `overlay` replacing its same-name entry.
pub fn merge_options(base: &TuningOptions, overlay: &TuningOptions) -> TuningOptions {
    let mut merged = TuningOptions::new();
    for option in base.iter() {
        if overlay.get(&option.name).is_none() {
            merged.push(&option.name, option.value.clone());
        }
    }
    for option in overlay.iter() {
        merged.push(&option.name, option.value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use hwpipe_core::params::TuningValue;

    use super::*;

    #[test]
    fn presets_validate() {
        for graph in [
            StageGraph::decode_flow(),
            StageGraph::encode_flow(),
            StageGraph::transcode_flow(),
        ] {
            graph.validate().expect("preset graph");
        }
        let t = StageGraph::transcode_flow();
        assert_eq!(t.input_shape(), Some(Shape::Packet));
        assert_eq!(t.output_shape(), Some(Shape::Encoded));
        assert_eq!(StageGraph::decode_flow().output_shape(), Some(Shape::HostFrame));
    }

    #[test]
    fn graph_validation_requires_a_stage() {
        let err = StageGraph::default().validate().expect_err("empty graph");
        assert!(err.to_string().contains("at least one stage"));
    }

    #[test]
    fn graph_validation_rejects_untyped_chain() {
        let graph = StageGraph::chain([
            StageConfig::new(StageRole::Decode),
            StageConfig::new(StageRole::Upload),
        ]);
        let err = graph.validate().expect_err("decode cannot feed upload");
        assert!(
            err.to_string()
                .contains("decode produces device frame but stage 1 upload consumes host frame")
        );
    }

    #[test]
    fn graph_validation_rejects_stage_after_encode() {
        let graph = StageGraph::chain([
            StageConfig::new(StageRole::Encode),
            StageConfig::new(StageRole::Download),
        ]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn graph_validation_rejects_zero_retry() {
        let mut graph = StageGraph::decode_flow();
        graph.stages[0].retry = Some(RetryPolicy {
            send_attempts: 0,
            ..RetryPolicy::no_retry()
        });
        let err = graph.validate().expect_err("zero attempts");
        assert!(err.to_string().contains("stage 0 decode"));
    }

    #[test]
    fn graph_validation_rejects_outputs_on_transfer_stage() {
        let mut graph = StageGraph::encode_flow();
        graph.stages[0].outputs = vec![OutputSpec::new(64, 64)];
        let err = graph.validate().expect_err("upload takes no ladder");
        assert!(err.to_string().contains("does not take outputs"));
    }

    #[test]
    fn graph_validation_rejects_ladder_mismatch() {
        let mut graph = StageGraph::transcode_flow();
        graph.stages[2].outputs.pop();
        let err = graph.validate().expect_err("3 channels for 4 rungs");
        assert!(err.to_string().contains("encoder has 3 outputs but the scaler emits 4"));
    }

    #[test]
    fn graph_validation_rejects_schema_mismatch() {
        let graph = StageGraph {
            graph_schema_version: GRAPH_SCHEMA_VERSION + 1,
            ..StageGraph::decode_flow()
        };
        let err = graph.validate().expect_err("schema mismatch must fail");
        assert!(err.to_string().contains("Graph schema mismatch"));
    }

    #[test]
    fn from_json_rejects_missing_schema_version() {
        let raw = r#"{"stages":[]}"#;
        let err = StageGraph::from_json_str(raw).expect_err("missing schema must fail");
        assert!(err.to_string().contains("got missing"));
    }

    #[test]
    fn from_json_rejects_schema_version_mismatch() {
        let raw = format!(
            "{{\"graph_schema_version\":{},\"stages\":[]}}",
            GRAPH_SCHEMA_VERSION + 1
        );
        let err = StageGraph::from_json_str(&raw).expect_err("mismatch schema must fail");
        assert!(err.to_string().contains("Graph schema mismatch"));
    }

    #[test]
    fn from_json_reads_overrides() {
        let raw = r#"{
            "graph_schema_version": 1,
            "max_flush_polls": 64,
            "stages": [
                {"kind": "decode", "retry": {"send_attempts": 3, "recv_attempts": 5, "backoff_us": 0}},
                {"kind": "encode", "options": [{"name": "gop", "value": {"int32": 12}}]}
            ]
        }"#;
        let graph = StageGraph::from_json_str(raw).expect("parse");
        graph.validate().expect("valid");
        assert_eq!(graph.max_flush_polls, Some(64));
        assert_eq!(graph.stages[0].retry_policy().recv_attempts, 5);
        assert_eq!(graph.stages[1].retry_policy(), RetryPolicy::for_role(StageRole::Encode));
        assert_eq!(graph.stages[1].options.get_i32("gop"), Some(12));
    }

    #[test]
    fn from_json_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let err = StageGraph::from_json_file(&path).expect_err("no file");
        assert!(err.to_string().contains("missing.json"));

        let path = dir.path().join("graph.json");
        std::fs::write(&path, r#"{"graph_schema_version":1,"stages":[{"kind":"scale"}]}"#)
            .expect("write");
        let graph = StageGraph::from_json_file(&path).expect("read");
        assert_eq!(graph.roles(), [StageRole::Scale]);
    }

    #[test]
    fn overlay_options_replace_by_name() {
        let base = presets::encoder();
        let overlay = TuningOptions::new().int32("bf", 2).int32("gop", 8);
        let merged = merge_options(&base, &overlay);
        assert_eq!(merged.get_i32("bf"), Some(2));
        assert_eq!(merged.get_i32("gop"), Some(8));
        assert_eq!(merged.get("expert_options"), Some(&TuningValue::String(String::new())));
        assert_eq!(merged.len(), base.len() + 1);
        merged.validate().expect("no duplicates");
    }
}

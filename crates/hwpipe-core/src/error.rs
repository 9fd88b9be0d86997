//! Typed error hierarchy for hwpipe.
//!
//! Uses `thiserror` for library-grade errors.  The CLI maps them to exit
//! status bits through [`crate::status::StepStatus`].
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured logging without string parsing.

use crate::stage::{StageOp, StageRole};

/// All errors originating from the hwpipe crates.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Device / session lifecycle ───────────────────────────────────
    #[error("Device {index} open failed: {message}")]
    DeviceOpen { index: u32, message: String },

    #[error("{stage} session init failed: {message}")]
    SessionInit { stage: StageRole, message: String },

    #[error("Device handle {0} is not open on this accelerator")]
    DeviceMismatch(u64),

    // ── Stage processing ─────────────────────────────────────────────
    #[error("{stage} stage error: {message}")]
    Stage { stage: StageRole, message: String },

    #[error("{stage} {op} still busy after {attempts} attempts")]
    RetryExhausted {
        stage: StageRole,
        op: StageOp,
        attempts: u32,
    },

    #[error("{stage} stage cannot accept {actual} input (expected {expected})")]
    UnexpectedArtifact {
        stage: StageRole,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{0} session used after close")]
    StageClosed(StageRole),

    // ── Bitstream ────────────────────────────────────────────────────
    #[error("Demux error: {0}")]
    Demux(String),

    #[error("Access unit exceeds window capacity of {capacity} bytes")]
    UnitTooLarge { capacity: usize },

    #[error("Mux error: {0}")]
    Mux(String),

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("{stage} flush did not reach end of stream after {polls} polls")]
    FlushStalled { stage: StageRole, polls: u32 },

    // ── Type contracts ───────────────────────────────────────────────
    #[error("Invalid stream parameters: {0}")]
    InvalidParams(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    // ── Invariants ───────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ── Remote proxy ─────────────────────────────────────────────────
    #[error("Remote stage error: {0}")]
    Remote(String),

    #[error("Remote protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Stable integer error code for structured logging.
    ///
    /// Codes are grouped by category:
    /// - 1xx: device/session lifecycle
    /// - 2xx: stage processing
    /// - 3xx: bitstream
    /// - 4xx: pipeline
    /// - 5xx: type contracts
    /// - 6xx: invariants
    /// - 7xx: remote proxy
    pub fn error_code(&self) -> u32 {
        match self {
            Self::DeviceOpen { .. } => 100,
            Self::SessionInit { .. } => 101,
            Self::DeviceMismatch(_) => 102,
            Self::Stage { .. } => 200,
            Self::RetryExhausted { .. } => 201,
            Self::UnexpectedArtifact { .. } => 202,
            Self::StageClosed(_) => 203,
            Self::Demux(_) => 300,
            Self::UnitTooLarge { .. } => 301,
            Self::Mux(_) => 302,
            Self::Pipeline(_) => 400,
            Self::FlushStalled { .. } => 401,
            Self::InvalidParams(_) => 500,
            Self::DimensionMismatch(_) => 501,
            Self::BufferTooSmall { .. } => 502,
            Self::InvariantViolation(_) => 600,
            Self::Remote(_) => 700,
            Self::Protocol(_) => 701,
        }
    }

    /// Whether this error is recoverable (pipeline can continue after logging).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RetryExhausted { .. } | Self::UnitTooLarge { .. } | Self::FlushStalled { .. }
        )
    }

    /// Stage role this error is attributed to, if any.
    pub fn stage(&self) -> Option<StageRole> {
        match self {
            Self::SessionInit { stage, .. }
            | Self::Stage { stage, .. }
            | Self::RetryExhausted { stage, .. }
            | Self::UnexpectedArtifact { stage, .. }
            | Self::FlushStalled { stage, .. } => Some(*stage),
            Self::StageClosed(stage) => Some(*stage),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the hwpipe crates.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_exhaustion_is_recoverable_but_stage_error_is_not() {
        let busy = EngineError::RetryExhausted {
            stage: StageRole::Scale,
            op: StageOp::Receive,
            attempts: 3,
        };
        assert!(busy.is_recoverable());
        assert_eq!(busy.error_code(), 201);
        assert_eq!(busy.to_string(), "scale receive still busy after 3 attempts");

        let hard = EngineError::Stage {
            stage: StageRole::Encode,
            message: "bitstream buffer lost".into(),
        };
        assert!(!hard.is_recoverable());
        assert_eq!(hard.stage(), Some(StageRole::Encode));
    }

    #[test]
    fn lifecycle_errors_carry_no_stage_when_device_level() {
        let err = EngineError::DeviceOpen {
            index: 3,
            message: "no such device".into(),
        };
        assert_eq!(err.stage(), None);
        assert_eq!(err.error_code(), 100);
        assert!(err.to_string().contains("Device 3"));
    }
}

use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::stage::StageRole;
use hwpipe_core::types::{Artifact, Frame, Residency};

/// Deterministic FNV-1a 64-bit hash.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Digest of a frame's visible samples, ignoring stride padding.
pub(crate) fn frame_digest(frame: &Frame) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for plane in 0..frame.planes.len() {
        for y in 0..frame.format.rows(plane, frame.height) {
            for byte in frame.row(plane, y) {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        }
    }
    hash
}

pub(crate) fn unexpected(stage: StageRole, expected: &'static str, actual: &Artifact) -> EngineError {
    EngineError::UnexpectedArtifact {
        stage,
        expected,
        actual: actual.label(),
    }
}

pub(crate) fn require_residency(stage: StageRole, frame: &Frame, want: Residency) -> Result<()> {
    if frame.residency == want {
        return Ok(());
    }
    Err(EngineError::Stage {
        stage,
        message: format!(
            "frame {} is {:?}-resident, stage needs {:?}",
            frame.frame_index, frame.residency, want
        ),
    })
}

/// Injects `TryAgain` answers on a fixed cadence (`sim_busy_every`).
///
/// `every == 0` disables injection; otherwise each `every`-th call is busy.
#[derive(Debug, Default)]
pub(crate) struct BusyInjector {
    every: u32,
    calls: u64,
}

impl BusyInjector {
    pub(crate) fn new(every: i32) -> Self {
        Self {
            every: every.max(0) as u32,
            calls: 0,
        }
    }

    pub(crate) fn busy(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.calls += 1;
        self.calls.is_multiple_of(self.every as u64)
    }
}

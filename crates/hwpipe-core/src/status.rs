//! Process exit status as a bitwise OR of failed steps.

use crate::error::EngineError;
use crate::stage::StageRole;

/// One bit per init/processing step; zero means every step succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StepStatus(u8);

impl StepStatus {
    pub const OK: Self = Self(0);
    pub const INPUT: Self = Self(0x01);
    pub const DEVICE: Self = Self(0x02);
    pub const PROCESSING: Self = Self(0x80);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bit reserved for a stage role.
    pub const fn for_role(role: StageRole) -> Self {
        Self(match role {
            StageRole::Decode => 0x04,
            StageRole::Scale => 0x08,
            StageRole::Upload => 0x10,
            StageRole::Download => 0x20,
            StageRole::Encode => 0x40,
        })
    }

    /// Bit that best describes where `err` came from.
    pub fn for_error(err: &EngineError) -> Self {
        match err {
            EngineError::DeviceOpen { .. } | EngineError::DeviceMismatch(_) => Self::DEVICE,
            EngineError::Demux(_) => Self::INPUT,
            other => other
                .stage()
                .map(Self::for_role)
                .unwrap_or(Self::PROCESSING),
        }
    }
}

impl std::ops::BitOr for StepStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StepStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_accumulate_per_failed_step() {
        let mut status = StepStatus::OK;
        status |= StepStatus::for_role(StageRole::Scale);
        status |= StepStatus::DEVICE;
        assert_eq!(status.bits(), 0x0A);
        assert!(status.contains(StepStatus::DEVICE));
        assert!(!status.contains(StepStatus::INPUT));
    }

    #[test]
    fn errors_map_to_their_stage_bit() {
        let err = EngineError::SessionInit {
            stage: StageRole::Encode,
            message: "no encoder cores".into(),
        };
        assert_eq!(StepStatus::for_error(&err), StepStatus::for_role(StageRole::Encode));
        assert_eq!(
            StepStatus::for_error(&EngineError::Mux("disk full".into())),
            StepStatus::PROCESSING
        );
    }
}

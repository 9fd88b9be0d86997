//! Device lifecycle and the accelerator seam.
//!
//! [`Accelerator`] is the narrow interface to whatever actually runs the
//! transforms: the in-process simulator, a vendor session API, or a remote
//! stage server.  The orchestrator only ever talks to this trait and to
//! the [`StageSession`]s it hands out.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::StreamParams;
use crate::stage::{StageRole, StageSession};

/// Opened device.  Copyable; it carries no ownership of the device itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Device ordinal requested at open time.
    pub index: u32,
    /// Accelerator-assigned identifier, unique per open.
    pub id: u64,
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device {}#{}", self.index, self.id)
    }
}

/// Factory for devices and stage sessions.
///
/// Implementations are shared read-only between the stages of one
/// pipeline, hence `Send + Sync` and `&self` receivers.
pub trait Accelerator: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    fn open_device(&self, index: u32) -> Result<DeviceHandle>;

    /// Create a session for `role` on `device`.
    ///
    /// `params` are validated here, once, before any resource is reserved.
    fn init_stage(
        &self,
        device: DeviceHandle,
        role: StageRole,
        params: &StreamParams,
    ) -> Result<Box<dyn StageSession>>;

    fn close_device(&self, device: DeviceHandle) -> Result<()>;
}

impl<A: Accelerator + ?Sized> Accelerator for std::sync::Arc<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open_device(&self, index: u32) -> Result<DeviceHandle> {
        (**self).open_device(index)
    }

    fn init_stage(
        &self,
        device: DeviceHandle,
        role: StageRole,
        params: &StreamParams,
    ) -> Result<Box<dyn StageSession>> {
        (**self).init_stage(device, role, params)
    }

    fn close_device(&self, device: DeviceHandle) -> Result<()> {
        (**self).close_device(device)
    }
}

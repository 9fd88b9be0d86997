//! In-process accelerator backed by the software stages of this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use hwpipe_core::device::{Accelerator, DeviceHandle};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::StreamParams;
use hwpipe_core::stage::{StageRole, StageSession};

use crate::decoder::SimDecoder;
use crate::encoder::SimEncoder;
use crate::oneshot::{OneShotStage, Resample, Transfer};

/// Number of device ordinals the simulator exposes by default.
pub const DEFAULT_DEVICE_COUNT: u32 = 4;

pub struct SimAccelerator {
    device_count: u32,
    fail_init: Option<StageRole>,
    next_id: AtomicU64,
    /// Open handle id → device index.
    open: Mutex<HashMap<u64, u32>>,
}

impl Default for SimAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAccelerator {
    pub fn new() -> Self {
        Self {
            device_count: DEFAULT_DEVICE_COUNT,
            fail_init: None,
            next_id: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_device_count(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    /// Make every `init_stage` for `role` fail, for teardown testing.
    pub fn failing_init(mut self, role: StageRole) -> Self {
        self.fail_init = Some(role);
        self
    }

    /// Devices currently open.
    pub fn open_devices(&self) -> usize {
        self.open.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn is_open(&self, device: DeviceHandle) -> Result<bool> {
        let open = self
            .open
            .lock()
            .map_err(|_| EngineError::InvariantViolation("device table lock poisoned".into()))?;
        Ok(open.get(&device.id) == Some(&device.index))
    }
}

impl Accelerator for SimAccelerator {
    fn name(&self) -> &str {
        "sim"
    }

    fn open_device(&self, index: u32) -> Result<DeviceHandle> {
        if index >= self.device_count {
            return Err(EngineError::DeviceOpen {
                index,
                message: format!("only {} simulated devices", self.device_count),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .map_err(|_| EngineError::InvariantViolation("device table lock poisoned".into()))?
            .insert(id, index);
        let handle = DeviceHandle { index, id };
        info!(%handle, "Simulated device opened");
        Ok(handle)
    }

    fn init_stage(
        &self,
        device: DeviceHandle,
        role: StageRole,
        params: &StreamParams,
    ) -> Result<Box<dyn StageSession>> {
        if !self.is_open(device)? {
            return Err(EngineError::DeviceMismatch(device.id));
        }
        params.validate()?;
        if self.fail_init == Some(role) {
            return Err(EngineError::SessionInit {
                stage: role,
                message: "injected init failure".into(),
            });
        }

        let session: Box<dyn StageSession> = match role {
            StageRole::Decode => Box::new(SimDecoder::new(params)?),
            StageRole::Scale => Box::new(OneShotStage::new(Resample::new(params), params)),
            StageRole::Upload => Box::new(OneShotStage::new(Transfer::upload(), params)),
            StageRole::Download => Box::new(OneShotStage::new(Transfer::download(), params)),
            StageRole::Encode => Box::new(SimEncoder::new(params)?),
        };
        debug!(%device, %role, width = params.width, height = params.height, "Session initialised");
        Ok(session)
    }

    fn close_device(&self, device: DeviceHandle) -> Result<()> {
        let removed = self
            .open
            .lock()
            .map_err(|_| EngineError::InvariantViolation("device table lock poisoned".into()))?
            .remove(&device.id);
        match removed {
            Some(_) => {
                info!(%device, "Simulated device closed");
                Ok(())
            }
            None => Err(EngineError::DeviceMismatch(device.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use hwpipe_core::types::CodecKind;

    use super::*;

    fn params() -> StreamParams {
        StreamParams::builder(32, 16)
            .codec(CodecKind::H264)
            .build()
            .expect("params")
    }

    #[test]
    fn every_role_initialises_on_an_open_device() {
        let accel = SimAccelerator::new();
        let dev = accel.open_device(0).expect("open");
        for role in StageRole::ALL {
            let session = accel.init_stage(dev, role, &params()).expect("init");
            assert_eq!(session.role(), role);
        }
        accel.close_device(dev).expect("close");
        assert_eq!(accel.open_devices(), 0);
    }

    #[test]
    fn closed_or_foreign_devices_are_rejected() {
        let accel = SimAccelerator::new();
        let dev = accel.open_device(1).expect("open");
        accel.close_device(dev).expect("close");
        let err = accel
            .init_stage(dev, StageRole::Decode, &params())
            .err()
            .expect("closed device");
        assert_eq!(err.error_code(), 102);
        assert!(accel.close_device(dev).is_err());
    }

    #[test]
    fn out_of_range_ordinal_fails_open() {
        let accel = SimAccelerator::new().with_device_count(1);
        let err = accel.open_device(3).expect_err("no device 3");
        assert!(matches!(err, EngineError::DeviceOpen { index: 3, .. }));
    }

    #[test]
    fn injected_failure_names_the_role() {
        let accel = SimAccelerator::new().failing_init(StageRole::Scale);
        let dev = accel.open_device(0).expect("open");
        let err = accel
            .init_stage(dev, StageRole::Scale, &params())
            .err()
            .expect("injected");
        assert_eq!(err.stage(), Some(StageRole::Scale));
    }
}

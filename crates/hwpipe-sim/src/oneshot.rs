//! Stages with no internal delay: one input in, one output out.
//!
//! [`OneShotStage`] owns the session state machine (pending slot, flush,
//! close) and delegates the pixel work to a [`Transform`].

use tracing::debug;

use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::{OutputSpec, StreamParams};
use hwpipe_core::stage::{RecvStatus, SendStatus, StageRole, StageSession};
use hwpipe_core::types::{Artifact, Frame, PixelFormat, Residency};

use crate::util::{BusyInjector, require_residency, unexpected};

/// Pixel work behind a [`OneShotStage`].
pub trait Transform: Send {
    fn role(&self) -> StageRole;
    fn apply(&mut self, input: &Artifact) -> Result<Artifact>;
}

pub struct OneShotStage<T> {
    transform: T,
    pending: Option<Artifact>,
    busy: BusyInjector,
    processed: u64,
    flushing: bool,
    closed: bool,
}

impl<T: Transform> OneShotStage<T> {
    pub fn new(transform: T, params: &StreamParams) -> Self {
        Self {
            transform,
            pending: None,
            busy: BusyInjector::new(params.options.get_i32("sim_busy_every").unwrap_or(0)),
            processed: 0,
            flushing: false,
            closed: false,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(EngineError::StageClosed(self.transform.role()));
        }
        Ok(())
    }
}

impl<T: Transform> StageSession for OneShotStage<T> {
    fn role(&self) -> StageRole {
        self.transform.role()
    }

    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus> {
        self.check_open()?;
        let Some(input) = input else {
            self.flushing = true;
            return Ok(if self.pending.is_some() {
                SendStatus::Accepted
            } else {
                SendStatus::EndOfStream
            });
        };
        if self.pending.is_some() || self.busy.busy() {
            return Ok(SendStatus::TryAgain);
        }
        self.pending = Some(self.transform.apply(input)?);
        self.processed += 1;
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<RecvStatus> {
        self.check_open()?;
        match self.pending.take() {
            Some(artifact) => Ok(RecvStatus::Ready(artifact)),
            None if self.flushing => Ok(RecvStatus::EndOfStream),
            None => Ok(RecvStatus::NeedMoreInput),
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.pending = None;
            debug!(stage = %self.transform.role(), processed = self.processed, "Session closed");
        }
        Ok(())
    }
}

// ─── Scaler ──────────────────────────────────────────────────────────────────

/// Nearest-neighbour resize to every rung of the output ladder.
///
/// One rung yields `Artifact::Frame`; several yield `Artifact::Ladder` in
/// rung order.
pub struct Resample {
    outputs: Vec<OutputSpec>,
}

impl Resample {
    pub fn new(params: &StreamParams) -> Self {
        Self {
            outputs: params.effective_outputs(),
        }
    }
}

/// Bytes per addressable sample unit of `plane` (an NV12 UV pair is one).
fn unit_bytes(format: PixelFormat, plane: usize) -> usize {
    match (format, plane) {
        (PixelFormat::Nv12, p) if p > 0 => 2,
        _ => format.bytes_per_sample(),
    }
}

pub fn resize(src: &Frame, width: u32, height: u32) -> Frame {
    let mut dst = Frame::alloc(width, height, src.format, src.residency);
    for (p, plane) in dst.planes.iter_mut().enumerate() {
        let unit = unit_bytes(src.format, p);
        let src_units = src.format.row_bytes(p, src.width) / unit;
        let src_rows = src.format.rows(p, src.height);
        let dst_units = src.format.row_bytes(p, width) / unit;
        let dst_rows = src.format.rows(p, height);
        for y in 0..dst_rows {
            let src_row = src.row(p, y * src_rows / dst_rows);
            let out = &mut plane.data[y * plane.stride..][..dst_units * unit];
            for x in 0..dst_units {
                let sx = x * src_units / dst_units;
                out[x * unit..(x + 1) * unit].copy_from_slice(&src_row[sx * unit..(sx + 1) * unit]);
            }
        }
    }
    dst.pts = src.pts;
    dst.frame_index = src.frame_index;
    dst
}

impl Transform for Resample {
    fn role(&self) -> StageRole {
        StageRole::Scale
    }

    fn apply(&mut self, input: &Artifact) -> Result<Artifact> {
        let Artifact::Frame(frame) = input else {
            return Err(unexpected(StageRole::Scale, "frame", input));
        };
        require_residency(StageRole::Scale, frame, Residency::Device)?;
        frame.validate()?;
        let mut rungs: Vec<Frame> = self
            .outputs
            .iter()
            .map(|out| resize(frame, out.width, out.height))
            .collect();
        if rungs.len() == 1
            && let Some(single) = rungs.pop()
        {
            return Ok(Artifact::Frame(single));
        }
        Ok(Artifact::Ladder(rungs))
    }
}

// ─── Host/device transfer ────────────────────────────────────────────────────

/// Moves frames across the host/device boundary.
pub struct Transfer {
    role: StageRole,
    from: Residency,
    to: Residency,
}

impl Transfer {
    pub fn upload() -> Self {
        Self {
            role: StageRole::Upload,
            from: Residency::Host,
            to: Residency::Device,
        }
    }

    pub fn download() -> Self {
        Self {
            role: StageRole::Download,
            from: Residency::Device,
            to: Residency::Host,
        }
    }

    fn move_frame(&self, frame: &Frame) -> Result<Frame> {
        require_residency(self.role, frame, self.from)?;
        frame.validate()?;
        let mut moved = frame.clone();
        moved.residency = self.to;
        Ok(moved)
    }
}

impl Transform for Transfer {
    fn role(&self) -> StageRole {
        self.role
    }

    fn apply(&mut self, input: &Artifact) -> Result<Artifact> {
        match input {
            Artifact::Frame(frame) => Ok(Artifact::Frame(self.move_frame(frame)?)),
            Artifact::Ladder(frames) => Ok(Artifact::Ladder(
                frames
                    .iter()
                    .map(|f| self.move_frame(f))
                    .collect::<Result<_>>()?,
            )),
            other => Err(unexpected(self.role, "frame", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use hwpipe_core::params::presets;

    use super::*;

    fn device_frame(w: u32, h: u32, format: PixelFormat) -> Frame {
        let mut f = Frame::alloc(w, h, format, Residency::Device);
        for plane in &mut f.planes {
            for (i, b) in plane.data.iter_mut().enumerate() {
                *b = i as u8;
            }
        }
        f
    }

    #[test]
    fn resize_picks_nearest_samples() {
        let src = device_frame(4, 4, PixelFormat::Yuv420p);
        let dst = resize(&src, 2, 2);
        assert_eq!(dst.planes[0].data, vec![0, 2, 8, 10]);
        assert_eq!(dst.planes[1].data, vec![0]);
        dst.validate().expect("valid layout");
    }

    #[test]
    fn nv12_chroma_pairs_stay_together() {
        let src = device_frame(4, 2, PixelFormat::Nv12);
        let dst = resize(&src, 2, 2);
        // Source UV row: [0 1][2 3]; one pair survives.
        assert_eq!(dst.planes[1].data, vec![0, 1]);
    }

    #[test]
    fn ladder_scaler_emits_one_frame_per_rung() {
        let params = StreamParams::builder(1920, 1080)
            .outputs(presets::abr_ladder())
            .build()
            .expect("params");
        let mut stage = OneShotStage::new(Resample::new(&params), &params);
        let input = Artifact::Frame(device_frame(64, 32, PixelFormat::Yuv420p));

        assert_eq!(stage.send(Some(&input)).expect("send"), SendStatus::Accepted);
        let RecvStatus::Ready(Artifact::Ladder(rungs)) = stage.receive().expect("recv") else {
            panic!("expected a ladder");
        };
        let sizes: Vec<_> = rungs.iter().map(|f| (f.width, f.height)).collect();
        assert_eq!(sizes, [(1280, 720), (720, 480), (480, 360), (288, 160)]);
        assert_eq!(stage.receive().expect("empty"), RecvStatus::NeedMoreInput);
    }

    #[test]
    fn occupied_slot_pushes_back() {
        let params = StreamParams::builder(8, 8).build().expect("params");
        let mut stage = OneShotStage::new(Transfer::upload(), &params);
        let input = Artifact::Frame(Frame::alloc(8, 8, PixelFormat::Yuv420p, Residency::Host));
        stage.send(Some(&input)).expect("first");
        assert_eq!(stage.send(Some(&input)).expect("second"), SendStatus::TryAgain);
    }

    #[test]
    fn flush_drains_pending_then_ends() {
        let params = StreamParams::builder(8, 8).build().expect("params");
        let mut stage = OneShotStage::new(Transfer::download(), &params);
        assert_eq!(stage.send(None).expect("flush"), SendStatus::EndOfStream);

        let mut stage = OneShotStage::new(Transfer::download(), &params);
        let input = Artifact::Frame(device_frame(8, 8, PixelFormat::Yuv420p));
        stage.send(Some(&input)).expect("send");
        assert_eq!(stage.send(None).expect("flush"), SendStatus::Accepted);
        let RecvStatus::Ready(Artifact::Frame(host)) = stage.receive().expect("recv") else {
            panic!("pending frame");
        };
        assert_eq!(host.residency, Residency::Host);
        assert_eq!(stage.receive().expect("eos"), RecvStatus::EndOfStream);
    }

    #[test]
    fn transfers_check_residency() {
        let params = StreamParams::builder(8, 8).build().expect("params");
        let mut stage = OneShotStage::new(Transfer::upload(), &params);
        let input = Artifact::Frame(device_frame(8, 8, PixelFormat::Yuv420p));
        let err = stage.send(Some(&input)).expect_err("already on device");
        assert_eq!(err.stage(), Some(StageRole::Upload));
    }

    #[test]
    fn close_twice_is_a_no_op() {
        let params = StreamParams::builder(8, 8).build().expect("params");
        let mut stage = OneShotStage::new(Resample::new(&params), &params);
        stage.close().expect("close");
        stage.close().expect("close again");
        assert!(stage.send(None).is_err());
    }
}

//! Software stand-in for a hardware decoder.
//!
//! Each access unit becomes one device-resident frame at the configured
//! geometry.  Pixel content is derived from the unit's bytes so tests can
//! tell frames apart.  Unless `low_latency` is set the decoder holds
//! `DEFAULT_REORDER_DEPTH` frames back, like a decoder waiting on
//! reordering, and only releases them on flush.

use std::collections::VecDeque;

use tracing::debug;

use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::{PropertyCallback, StreamParams};
use hwpipe_core::stage::{RecvStatus, SendStatus, StageRole, StageSession};
use hwpipe_core::types::{Artifact, BitstreamPacket, CodecKind, Frame, PixelFormat, Residency};

use crate::util::{BusyInjector, fnv1a, unexpected};

/// Frames held back when `low_latency` is 0.
pub const DEFAULT_REORDER_DEPTH: usize = 2;

pub struct SimDecoder {
    codec: CodecKind,
    width: u32,
    height: u32,
    format: PixelFormat,
    delay: usize,
    queue: VecDeque<Frame>,
    on_change: Option<PropertyCallback>,
    busy: BusyInjector,
    decoded: u64,
    flushing: bool,
    closed: bool,
}

impl SimDecoder {
    pub fn new(params: &StreamParams) -> Result<Self> {
        let codec = params.codec.ok_or_else(|| EngineError::SessionInit {
            stage: StageRole::Decode,
            message: "decoder needs a codec".into(),
        })?;
        let opts = &params.options;
        let format = match opts.get_i32("out_fmt") {
            None => params.format,
            Some(0) => PixelFormat::Yuv420p,
            Some(1) => PixelFormat::Nv12,
            Some(2) => PixelFormat::Yuv420p10le,
            Some(other) => {
                return Err(EngineError::SessionInit {
                    stage: StageRole::Decode,
                    message: format!("unsupported out_fmt {other}"),
                });
            }
        };
        let delay = if opts.get_i32("low_latency").unwrap_or(0) == 1 {
            0
        } else {
            DEFAULT_REORDER_DEPTH
        };
        Ok(Self {
            codec,
            width: params.width,
            height: params.height,
            format,
            delay,
            queue: VecDeque::with_capacity(delay + 1),
            on_change: opts.get_callback("prop_change_callback").cloned(),
            busy: BusyInjector::new(opts.get_i32("sim_busy_every").unwrap_or(0)),
            decoded: 0,
            flushing: false,
            closed: false,
        })
    }

    pub fn frames_decoded(&self) -> u64 {
        self.decoded
    }

    fn decode(&mut self, packet: &BitstreamPacket) -> Frame {
        let seed = fnv1a(&packet.data);
        let mut frame = Frame::alloc(self.width, self.height, self.format, Residency::Device);
        for (p, plane) in frame.planes.iter_mut().enumerate() {
            let base = (seed >> (p * 8)) as u8;
            for (y, row) in plane.data.chunks_mut(plane.stride).enumerate() {
                for (x, px) in row.iter_mut().enumerate() {
                    *px = base.wrapping_add((x ^ y) as u8);
                }
            }
        }
        frame.pts = packet.pts;
        frame.frame_index = self.decoded;

        if self.decoded == 0
            && let Some(callback) = &self.on_change
        {
            callback.call(self.width, self.height, self.format);
        }
        self.decoded += 1;
        frame
    }
}

impl StageSession for SimDecoder {
    fn role(&self) -> StageRole {
        StageRole::Decode
    }

    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus> {
        if self.closed {
            return Err(EngineError::StageClosed(StageRole::Decode));
        }
        let Some(input) = input else {
            self.flushing = true;
            if self.queue.is_empty() {
                debug!(codec = %self.codec, "Decoder flush: nothing buffered");
                return Ok(SendStatus::EndOfStream);
            }
            return Ok(SendStatus::Accepted);
        };
        let Artifact::Packet(packet) = input else {
            return Err(unexpected(StageRole::Decode, "packet", input));
        };
        if self.flushing {
            return Err(EngineError::Stage {
                stage: StageRole::Decode,
                message: "input after flush request".into(),
            });
        }
        if self.queue.len() > self.delay || self.busy.busy() {
            return Ok(SendStatus::TryAgain);
        }
        let frame = self.decode(packet);
        self.queue.push_back(frame);
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<RecvStatus> {
        if self.closed {
            return Err(EngineError::StageClosed(StageRole::Decode));
        }
        let releasable = self.flushing || self.queue.len() > self.delay;
        if releasable && let Some(frame) = self.queue.pop_front() {
            return Ok(RecvStatus::Ready(Artifact::Frame(frame)));
        }
        if self.flushing {
            return Ok(RecvStatus::EndOfStream);
        }
        Ok(RecvStatus::NeedMoreInput)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            debug!(decoded = self.decoded, dropped = self.queue.len(), "Decoder closed");
            self.queue.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use hwpipe_core::params::TuningOptions;

    use super::*;

    fn params(options: TuningOptions) -> StreamParams {
        StreamParams::builder(16, 8)
            .codec(CodecKind::H264)
            .options(options)
            .build()
            .expect("params")
    }

    fn packet(pts: i64, byte: u8) -> Artifact {
        Artifact::Packet(BitstreamPacket {
            data: vec![0, 0, 1, 0x65, byte],
            pts,
            is_keyframe: pts == 0,
        })
    }

    #[test]
    fn flush_at_startup_reports_end_of_stream() {
        let mut dec = SimDecoder::new(&params(TuningOptions::new())).expect("init");
        assert_eq!(dec.send(None).expect("flush"), SendStatus::EndOfStream);
    }

    #[test]
    fn reorder_depth_holds_frames_until_flush() {
        let mut dec = SimDecoder::new(&params(TuningOptions::new())).expect("init");
        for pts in 0..2 {
            assert_eq!(dec.send(Some(&packet(pts, pts as u8))).expect("send"), SendStatus::Accepted);
            assert_eq!(dec.receive().expect("recv"), RecvStatus::NeedMoreInput);
        }
        dec.send(Some(&packet(2, 2))).expect("send");
        let RecvStatus::Ready(Artifact::Frame(first)) = dec.receive().expect("recv") else {
            panic!("third input releases the first frame");
        };
        assert_eq!(first.pts, 0);
        assert_eq!(first.residency, Residency::Device);

        assert_eq!(dec.send(None).expect("flush"), SendStatus::Accepted);
        let mut drained = Vec::new();
        while let RecvStatus::Ready(Artifact::Frame(f)) = dec.receive().expect("drain") {
            drained.push(f.pts);
        }
        assert_eq!(drained, [1, 2]);
        assert_eq!(dec.receive().expect("eos"), RecvStatus::EndOfStream);
    }

    #[test]
    fn low_latency_emits_immediately() {
        let mut dec =
            SimDecoder::new(&params(TuningOptions::new().int32("low_latency", 1))).expect("init");
        dec.send(Some(&packet(0, 1))).expect("send");
        assert!(dec.receive().expect("recv").is_ready());
    }

    #[test]
    fn property_callback_fires_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let cb = PropertyCallback::new(move |w, h, _| {
            assert_eq!((w, h), (16, 8));
            seen.fetch_add(1, Ordering::Relaxed);
        });
        let opts = hwpipe_core::params::presets::decoder(PixelFormat::Nv12, cb);
        let mut dec = SimDecoder::new(&params(opts)).expect("init");
        for pts in 0..3 {
            dec.send(Some(&packet(pts, 0))).expect("send");
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn different_units_decode_to_different_pictures() {
        let opts = TuningOptions::new().int32("low_latency", 1);
        let mut dec = SimDecoder::new(&params(opts)).expect("init");
        let mut frames = Vec::new();
        for byte in [1, 2] {
            dec.send(Some(&packet(0, byte))).expect("send");
            let RecvStatus::Ready(Artifact::Frame(f)) = dec.receive().expect("recv") else {
                panic!("low latency frame");
            };
            frames.push(f);
        }
        assert_ne!(frames[0].planes, frames[1].planes);
    }

    #[test]
    fn wrong_input_and_use_after_close_are_errors() {
        let mut dec = SimDecoder::new(&params(TuningOptions::new())).expect("init");
        let frame = Artifact::Frame(Frame::alloc(2, 2, PixelFormat::Yuv420p, Residency::Host));
        let err = dec.send(Some(&frame)).expect_err("frame into decoder");
        assert!(err.to_string().contains("cannot accept frame"));

        dec.close().expect("close");
        dec.close().expect("second close is a no-op");
        assert!(matches!(dec.receive(), Err(EngineError::StageClosed(StageRole::Decode))));
    }

    #[test]
    fn missing_codec_fails_init() {
        let params = StreamParams::builder(16, 8).build().expect("params");
        let err = SimDecoder::new(&params).err().expect("no codec");
        assert_eq!(err.error_code(), 101);
    }
}

//! Software stand-in for a multi-channel hardware encoder.
//!
//! One channel per rung of the output ladder.  Every input picture (a
//! frame, or a ladder with one frame per channel) is turned into one
//! Annex-B access unit per channel.  Output lags input by `lookahead`
//! pictures, the way a rate-controlled encoder buffers, and the backlog is
//! released on flush.
//!
//! Emitted units are well-formed enough for the extractor to delimit and
//! classify them: an IDR/IRAP slice header on keyframes, a plain slice
//! otherwise, with emulation prevention applied to the payload.

use std::collections::VecDeque;

use tracing::{debug, info};

use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::StreamParams;
use hwpipe_core::stage::{RecvStatus, SendStatus, StageRole, StageSession};
use hwpipe_core::types::{Artifact, CodecKind, EncodedBuffer, Frame, Residency};

use crate::util::{BusyInjector, frame_digest, require_residency, unexpected};

/// Pictures buffered before the first output when `lookahead` is unset.
pub const DEFAULT_LOOKAHEAD: usize = 2;
/// Keyframe interval when `gop` is unset.
pub const DEFAULT_GOP: u64 = 30;

#[derive(Clone, Copy, Debug)]
struct Channel {
    width: u32,
    height: u32,
    codec: CodecKind,
}

pub struct SimEncoder {
    channels: Vec<Channel>,
    lookahead: usize,
    gop: u64,
    queue: VecDeque<Vec<EncodedBuffer>>,
    busy: BusyInjector,
    encoded: u64,
    bytes: u64,
    flushing: bool,
    closed: bool,
}

impl SimEncoder {
    pub fn new(params: &StreamParams) -> Result<Self> {
        let channels = params
            .effective_outputs()
            .into_iter()
            .enumerate()
            .map(|(i, out)| {
                let codec = out.codec.or(params.codec).ok_or_else(|| EngineError::SessionInit {
                    stage: StageRole::Encode,
                    message: format!("channel {i} has no codec"),
                })?;
                Ok(Channel {
                    width: out.width,
                    height: out.height,
                    codec,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let opts = &params.options;
        let lookahead = match opts.get_i32("lookahead") {
            Some(n) if n >= 0 => n as usize,
            _ => DEFAULT_LOOKAHEAD,
        };
        let gop = match opts.get_i32("gop") {
            Some(n) if n > 0 => n as u64,
            _ => DEFAULT_GOP,
        };
        debug!(channels = channels.len(), lookahead, gop, "Encoder configured");

        Ok(Self {
            channels,
            lookahead,
            gop,
            queue: VecDeque::with_capacity(lookahead + 1),
            busy: BusyInjector::new(opts.get_i32("sim_busy_every").unwrap_or(0)),
            encoded: 0,
            bytes: 0,
            flushing: false,
            closed: false,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    fn pictures<'a>(&self, input: &'a Artifact) -> Result<Vec<&'a Frame>> {
        let frames: Vec<&Frame> = match input {
            Artifact::Frame(frame) => vec![frame],
            Artifact::Ladder(frames) => frames.iter().collect(),
            other => return Err(unexpected(StageRole::Encode, "frame or ladder", other)),
        };
        if frames.len() != self.channels.len() {
            return Err(EngineError::DimensionMismatch(format!(
                "encoder has {} channels, input carries {} pictures",
                self.channels.len(),
                frames.len()
            )));
        }
        for (ch, (frame, channel)) in frames.iter().zip(&self.channels).enumerate() {
            require_residency(StageRole::Encode, frame, Residency::Device)?;
            if (frame.width, frame.height) != (channel.width, channel.height) {
                return Err(EngineError::DimensionMismatch(format!(
                    "channel {ch} expects {}x{}, got {}x{}",
                    channel.width, channel.height, frame.width, frame.height
                )));
            }
        }
        Ok(frames)
    }

    fn encode(&mut self, frames: &[&Frame]) -> Vec<EncodedBuffer> {
        let is_keyframe = self.encoded.is_multiple_of(self.gop);
        let buffers: Vec<EncodedBuffer> = frames
            .iter()
            .zip(&self.channels)
            .enumerate()
            .map(|(channel, (frame, ch))| EncodedBuffer {
                channel,
                data: annexb_unit(ch.codec, is_keyframe, frame),
                pts: frame.pts,
                is_keyframe,
            })
            .collect();
        self.encoded += 1;
        self.bytes += buffers.iter().map(|b| b.data.len() as u64).sum::<u64>();
        buffers
    }
}

/// One access unit: start code, slice NAL header, escaped payload.
pub fn annexb_unit(codec: CodecKind, is_keyframe: bool, frame: &Frame) -> Vec<u8> {
    let mut out = vec![0, 0, 1];
    match (codec, is_keyframe) {
        // nal_ref_idc 3, IDR slice / non-IDR slice.
        (CodecKind::H264, true) => out.push(0x65),
        (CodecKind::H264, false) => out.push(0x41),
        // IDR_W_RADL (19) / TRAIL_R (1); first_slice_segment_in_pic_flag set.
        (CodecKind::Hevc, true) => out.extend_from_slice(&[0x26, 0x01, 0x80]),
        (CodecKind::Hevc, false) => out.extend_from_slice(&[0x02, 0x01, 0x80]),
    }

    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(&(frame.width as u16).to_be_bytes());
    payload.extend_from_slice(&(frame.height as u16).to_be_bytes());
    payload.extend_from_slice(&(frame.pts as u32).to_be_bytes());
    payload.extend_from_slice(&frame_digest(frame).to_be_bytes());
    // rbsp_stop_one_bit
    payload.push(0x80);
    escape_into(&payload, &mut out);
    out
}

/// Insert emulation-prevention bytes so no start code appears in `rbsp`.
fn escape_into(rbsp: &[u8], out: &mut Vec<u8>) {
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
}

impl StageSession for SimEncoder {
    fn role(&self) -> StageRole {
        StageRole::Encode
    }

    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus> {
        if self.closed {
            return Err(EngineError::StageClosed(StageRole::Encode));
        }
        let Some(input) = input else {
            self.flushing = true;
            return Ok(if self.queue.is_empty() {
                SendStatus::EndOfStream
            } else {
                SendStatus::Accepted
            });
        };
        if self.flushing {
            return Err(EngineError::Stage {
                stage: StageRole::Encode,
                message: "input after flush request".into(),
            });
        }
        let frames = self.pictures(input)?;
        if self.queue.len() > self.lookahead || self.busy.busy() {
            return Ok(SendStatus::TryAgain);
        }
        let buffers = self.encode(&frames);
        self.queue.push_back(buffers);
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<RecvStatus> {
        if self.closed {
            return Err(EngineError::StageClosed(StageRole::Encode));
        }
        let releasable = self.flushing || self.queue.len() > self.lookahead;
        if releasable && let Some(buffers) = self.queue.pop_front() {
            return Ok(RecvStatus::Ready(Artifact::Encoded(buffers)));
        }
        if self.flushing {
            return Ok(RecvStatus::EndOfStream);
        }
        Ok(RecvStatus::NeedMoreInput)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            info!(
                pictures = self.encoded,
                channels = self.channels.len(),
                bytes = self.bytes,
                "Encoder closed"
            );
            self.queue.clear();
        }
        Ok(())
    }
}

//! Wire protocol between a remote stage client and a stage server.
//!
//! Every message is a little-endian `u32` length followed by a postcard
//! payload.  One request, one response, in order, on a single TCP stream.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hwpipe_core::device::DeviceHandle;
use hwpipe_core::error::EngineError;
use hwpipe_core::params::StreamParams;
use hwpipe_core::stage::{RecvStatus, SendStatus, StageOp, StageRole};
use hwpipe_core::types::{Artifact, ArtifactHandle};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted payload.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// How device-resident artifacts cross the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Device frames stay on the server; the client holds handles.
    #[default]
    Handle,
    /// Every artifact is copied across.
    Copy,
}

impl std::str::FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "handle" => Ok(Self::Handle),
            "copy" => Ok(Self::Copy),
            other => Err(format!("unknown transfer mode '{other}', use handle or copy")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireArtifact {
    /// Server-resident, valid until the producing session's next receive.
    Handle(ArtifactHandle),
    Inline(Artifact),
}

impl From<Artifact> for WireArtifact {
    fn from(artifact: Artifact) -> Self {
        match artifact {
            Artifact::Handle(handle) => Self::Handle(handle),
            other => Self::Inline(other),
        }
    }
}

impl From<WireArtifact> for Artifact {
    fn from(wire: WireArtifact) -> Self {
        match wire {
            WireArtifact::Handle(handle) => Artifact::Handle(handle),
            WireArtifact::Inline(artifact) => artifact,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRecv {
    Ready(WireArtifact),
    TryAgain,
    NeedMoreInput,
    EndOfStream,
}

impl From<WireRecv> for RecvStatus {
    fn from(wire: WireRecv) -> Self {
        match wire {
            WireRecv::Ready(artifact) => RecvStatus::Ready(artifact.into()),
            WireRecv::TryAgain => RecvStatus::TryAgain,
            WireRecv::NeedMoreInput => RecvStatus::NeedMoreInput,
            WireRecv::EndOfStream => RecvStatus::EndOfStream,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Hello {
        version: u32,
        transfer: TransferMode,
    },
    OpenDevice {
        index: u32,
    },
    CloseDevice {
        device: DeviceHandle,
    },
    Init {
        device: DeviceHandle,
        role: StageRole,
        params: StreamParams,
    },
    Send {
        session: u64,
        input: Option<WireArtifact>,
    },
    Receive {
        session: u64,
    },
    Close {
        session: u64,
    },
    Goodbye,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    HelloOk { version: u32, accelerator: String },
    Device { device: DeviceHandle },
    Session { session: u64 },
    Sent { status: SendStatus },
    Received { status: WireRecv },
    Ok,
    Err { error: WireError },
}

/// The parts of an [`EngineError`] the client needs to rebuild it:
/// recoverability and the failing role survive the trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    DeviceOpen {
        index: u32,
        message: String,
    },
    SessionInit {
        stage: StageRole,
        message: String,
    },
    DeviceMismatch(u64),
    Stage {
        stage: StageRole,
        message: String,
    },
    RetryExhausted {
        stage: StageRole,
        op: StageOp,
        attempts: u32,
    },
    Other {
        code: u32,
        message: String,
    },
}

impl From<&EngineError> for WireError {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::DeviceOpen { index, message } => Self::DeviceOpen {
                index: *index,
                message: message.clone(),
            },
            EngineError::SessionInit { stage, message } => Self::SessionInit {
                stage: *stage,
                message: message.clone(),
            },
            EngineError::DeviceMismatch(id) => Self::DeviceMismatch(*id),
            EngineError::RetryExhausted {
                stage,
                op,
                attempts,
            } => Self::RetryExhausted {
                stage: *stage,
                op: *op,
                attempts: *attempts,
            },
            other => match other.stage() {
                Some(stage) => Self::Stage {
                    stage,
                    message: other.to_string(),
                },
                None => Self::Other {
                    code: other.error_code(),
                    message: other.to_string(),
                },
            },
        }
    }
}

impl From<WireError> for EngineError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::DeviceOpen { index, message } => Self::DeviceOpen { index, message },
            WireError::SessionInit { stage, message } => Self::SessionInit { stage, message },
            WireError::DeviceMismatch(id) => Self::DeviceMismatch(id),
            WireError::Stage { stage, message } => Self::Stage { stage, message },
            WireError::RetryExhausted {
                stage,
                op,
                attempts,
            } => Self::RetryExhausted {
                stage,
                op,
                attempts,
            },
            WireError::Other { code, message } => Self::Remote(format!("[{code}] {message}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge(usize),

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Box<Response>),
}

impl From<ProtoError> for EngineError {
    fn from(err: ProtoError) -> Self {
        EngineError::Protocol(err.to_string())
    }
}

pub fn write_frame<W: Write, T: Serialize>(mut w: W, msg: &T) -> Result<(), ProtoError> {
    let payload = postcard::to_stdvec(msg)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtoError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(mut r: R) -> Result<T, ProtoError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtoError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(postcard::from_bytes(&payload)?)
}

//! The stage session contract.
//!
//! Every accelerated transform (decode, scale, upload, download, encode)
//! is driven through the same two calls:
//!
//! ```text
//!   send(Some(input)) ──► Accepted | TryAgain | NeedMoreInput | EndOfStream
//!   send(None)        ──► flush request, same statuses
//!   receive()         ──► Ready(artifact) | TryAgain | NeedMoreInput | EndOfStream
//! ```
//!
//! Hard failures are `Err(EngineError::Stage { .. })`.  `TryAgain` is
//! transient and is absorbed by [`crate::retry::RetryingStage`];
//! `NeedMoreInput` means the stage is buffering and has nothing to emit yet.
//!
//! `receive` moves its artifact out to the caller.  A stage never keeps a
//! reference to something it has returned.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Artifact;

/// Which transform a session performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Decode,
    Scale,
    Upload,
    Download,
    Encode,
}

impl StageRole {
    pub const ALL: [StageRole; 5] = [
        Self::Decode,
        Self::Scale,
        Self::Upload,
        Self::Download,
        Self::Encode,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Scale => "scale",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Encode => "encode",
        }
    }
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two data-path operations of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOp {
    Send,
    Receive,
}

impl std::fmt::Display for StageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Receive => "receive",
        })
    }
}

/// Outcome of [`StageSession::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    /// Input (or the flush request) was taken.
    Accepted,
    /// The stage is busy; the same input must be offered again.
    TryAgain,
    /// The stage wants more data before it can do anything with this call.
    NeedMoreInput,
    /// A flush request found nothing left to emit.
    EndOfStream,
}

/// Outcome of [`StageSession::receive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecvStatus {
    /// Ownership of the artifact moves to the caller.
    Ready(Artifact),
    /// Output is in flight; ask again.
    TryAgain,
    /// Nothing to emit until more input arrives.
    NeedMoreInput,
    /// Flush finished; the stage will emit nothing further.
    EndOfStream,
}

impl RecvStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// One accelerated transform bound to a device.
///
/// Sessions are created by [`crate::device::Accelerator::init_stage`] and
/// are exclusively owned by one control loop, so no method takes `&self`
/// for mutation and none needs locking.
pub trait StageSession: Send {
    fn role(&self) -> StageRole;

    /// Offer `input` to the stage, or request a flush with `None`.
    ///
    /// The input is borrowed: on `TryAgain` the caller still has it and
    /// offers it again.
    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus>;

    /// Collect the next output, if one is ready.
    fn receive(&mut self) -> Result<RecvStatus>;

    /// Release the session.  Calling it more than once is a no-op.
    fn close(&mut self) -> Result<()>;
}

impl<S: StageSession + ?Sized> StageSession for Box<S> {
    fn role(&self) -> StageRole {
        (**self).role()
    }

    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus> {
        (**self).send(input)
    }

    fn receive(&mut self) -> Result<RecvStatus> {
        (**self).receive()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// ─── Output slot ─────────────────────────────────────────────────────────────

/// Holder for the single live output of a stage that must keep it around.
///
/// Filling the slot releases whatever it held before, so at most one value
/// is live per slot.  Callers that need the value take it out explicitly.
#[derive(Debug)]
pub struct OutputSlot<T> {
    held: Option<T>,
    released: u64,
}

impl<T> Default for OutputSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputSlot<T> {
    pub const fn new() -> Self {
        Self {
            held: None,
            released: 0,
        }
    }

    /// Store `value`, releasing the previous occupant first.
    pub fn fill(&mut self, value: T) -> &T {
        self.release();
        self.held.insert(value)
    }

    pub fn get(&self) -> Option<&T> {
        self.held.as_ref()
    }

    /// Move the value out, leaving the slot empty.
    pub fn take(&mut self) -> Option<T> {
        self.held.take()
    }

    /// Drop the held value.  Returns whether anything was released.
    pub fn release(&mut self) -> bool {
        let had = self.held.take().is_some();
        if had {
            self.released += 1;
        }
        had
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_none()
    }

    /// Number of values released by `fill` or `release` so far.
    pub fn released(&self) -> u64 {
        self.released
    }
}

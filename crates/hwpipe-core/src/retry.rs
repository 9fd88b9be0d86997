//! Bounded retry for transient `TryAgain` statuses.
//!
//! Stage latencies differ by orders of magnitude (an upload answers in
//! microseconds, a batching scaler may hold frames for a long time), so
//! each role gets its own bound.  Send and receive bounds are independent.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::stage::{RecvStatus, SendStatus, StageOp, StageRole, StageSession};
use crate::types::Artifact;

/// Sleep between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_micros(100);

/// Attempts for the encoder's send and receive calls.
pub const ENCODE_ATTEMPTS: u32 = 10;
/// Attempts for the host/device transfer stages.
pub const TRANSFER_ATTEMPTS: u32 = 100;
/// Attempts for the scaler, which may batch internally.
pub const SCALE_ATTEMPTS: u32 = 1_000_000;
/// Attempts for the decoder's send and receive calls.
pub const DECODE_ATTEMPTS: u32 = 10;

/// Attempt bounds for one stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total `send` calls before giving up on one input (at least 1).
    pub send_attempts: u32,
    /// Total `receive` calls before giving up on one output (at least 1).
    pub recv_attempts: u32,
    /// Pause between attempts.
    #[serde(with = "micros", rename = "backoff_us")]
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Default bounds for `role`.
    pub const fn for_role(role: StageRole) -> Self {
        let attempts = match role {
            StageRole::Decode => DECODE_ATTEMPTS,
            StageRole::Scale => SCALE_ATTEMPTS,
            StageRole::Upload | StageRole::Download => TRANSFER_ATTEMPTS,
            StageRole::Encode => ENCODE_ATTEMPTS,
        };
        Self {
            send_attempts: attempts,
            recv_attempts: attempts,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Single attempt, no sleeping.
    pub const fn no_retry() -> Self {
        Self {
            send_attempts: 1,
            recv_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_attempts == 0 || self.recv_attempts == 0 {
            return Err(EngineError::InvariantViolation(format!(
                "retry policy needs at least one attempt per call (send={}, receive={})",
                self.send_attempts, self.recv_attempts
            )));
        }
        Ok(())
    }
}

mod micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

// ─── RetryingStage ───────────────────────────────────────────────────────────

/// Wraps a session and absorbs `TryAgain` up to the policy's bounds.
///
/// Exhausting a bound returns the recoverable
/// [`EngineError::RetryExhausted`].  Every other status passes through.
pub struct RetryingStage<S> {
    inner: S,
    policy: RetryPolicy,
    retries: u64,
}

impl<S: StageSession> RetryingStage<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retries: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// `TryAgain` answers absorbed so far.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn pause(&self) {
        if !self.policy.backoff.is_zero() {
            std::thread::sleep(self.policy.backoff);
        }
    }

    fn exhausted(&self, op: StageOp, attempts: u32) -> EngineError {
        debug!(stage = %self.inner.role(), %op, attempts, "Retry bound reached");
        EngineError::RetryExhausted {
            stage: self.inner.role(),
            op,
            attempts,
        }
    }
}

impl<S: StageSession> StageSession for RetryingStage<S> {
    fn role(&self) -> StageRole {
        self.inner.role()
    }

    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus> {
        let attempts = self.policy.send_attempts.max(1);
        for attempt in 1..=attempts {
            match self.inner.send(input)? {
                SendStatus::TryAgain => {
                    self.retries += 1;
                    trace!(stage = %self.inner.role(), attempt, "send: try again");
                    if attempt < attempts {
                        self.pause();
                    }
                }
                other => return Ok(other),
            }
        }
        Err(self.exhausted(StageOp::Send, attempts))
    }

    fn receive(&mut self) -> Result<RecvStatus> {
        let attempts = self.policy.recv_attempts.max(1);
        for attempt in 1..=attempts {
            match self.inner.receive()? {
                RecvStatus::TryAgain => {
                    self.retries += 1;
                    trace!(stage = %self.inner.role(), attempt, "receive: try again");
                    if attempt < attempts {
                        self.pause();
                    }
                }
                other => return Ok(other),
            }
        }
        Err(self.exhausted(StageOp::Receive, attempts))
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::types::{BitstreamPacket, EncodedBuffer};

    /// Replays scripted statuses; counts calls.
    struct Scripted {
        sends: VecDeque<SendStatus>,
        recvs: VecDeque<RecvStatus>,
        send_calls: u32,
        recv_calls: u32,
    }

    impl Scripted {
        fn new(sends: Vec<SendStatus>, recvs: Vec<RecvStatus>) -> Self {
            Self {
                sends: sends.into(),
                recvs: recvs.into(),
                send_calls: 0,
                recv_calls: 0,
            }
        }
    }

    impl StageSession for Scripted {
        fn role(&self) -> StageRole {
            StageRole::Encode
        }

        fn send(&mut self, _input: Option<&Artifact>) -> Result<SendStatus> {
            self.send_calls += 1;
            Ok(self.sends.pop_front().unwrap_or(SendStatus::Accepted))
        }

        fn receive(&mut self) -> Result<RecvStatus> {
            self.recv_calls += 1;
            Ok(self.recvs.pop_front().unwrap_or(RecvStatus::NeedMoreInput))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn encoded(pts: i64) -> Artifact {
        Artifact::Encoded(vec![EncodedBuffer {
            channel: 0,
            data: vec![0, 0, 1, 0x65],
            pts,
            is_keyframe: true,
        }])
    }

    fn fast(send: u32, recv: u32) -> RetryPolicy {
        RetryPolicy {
            send_attempts: send,
            recv_attempts: recv,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn artifact_survives_retries_up_to_the_bound() {
        let mut recvs = vec![RecvStatus::TryAgain; 9];
        recvs.push(RecvStatus::Ready(encoded(4)));
        let mut stage = RetryingStage::new(Scripted::new(vec![], recvs), fast(1, 10));

        let status = stage.receive().expect("tenth attempt succeeds");
        assert_eq!(status, RecvStatus::Ready(encoded(4)));
        assert_eq!(stage.inner().recv_calls, 10);
        assert_eq!(stage.retries(), 9);
    }

    #[test]
    fn exceeding_the_bound_is_recoverable() {
        let recvs = vec![RecvStatus::TryAgain; 11];
        let mut stage = RetryingStage::new(Scripted::new(vec![], recvs), fast(1, 10));

        let err = stage.receive().expect_err("bound of 10 is exceeded");
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            EngineError::RetryExhausted {
                op: StageOp::Receive,
                attempts: 10,
                ..
            }
        ));
        assert_eq!(stage.inner().recv_calls, 10);
    }

    #[test]
    fn send_and_receive_bounds_are_independent() {
        // A busy send must not eat into the receive budget and vice versa.
        let sends = vec![SendStatus::TryAgain; 2];
        let recvs = vec![RecvStatus::TryAgain, RecvStatus::Ready(encoded(0))];
        let mut stage = RetryingStage::new(Scripted::new(sends, recvs), fast(3, 2));
        let packet = Artifact::Packet(BitstreamPacket {
            data: vec![0, 0, 1, 0x65],
            pts: 0,
            is_keyframe: true,
        });

        assert_eq!(stage.send(Some(&packet)).expect("third send"), SendStatus::Accepted);
        assert!(stage.receive().expect("second receive").is_ready());
        assert_eq!(stage.inner().send_calls, 3);
        assert_eq!(stage.inner().recv_calls, 2);
    }

    #[test]
    fn non_transient_statuses_pass_through_untouched() {
        let mut stage = RetryingStage::new(
            Scripted::new(vec![SendStatus::EndOfStream], vec![RecvStatus::NeedMoreInput]),
            fast(5, 5),
        );
        assert_eq!(stage.send(None).expect("send"), SendStatus::EndOfStream);
        assert_eq!(stage.receive().expect("recv"), RecvStatus::NeedMoreInput);
        assert_eq!(stage.retries(), 0);
    }

    #[test]
    fn role_defaults_differ_by_orders_of_magnitude() {
        assert_eq!(RetryPolicy::for_role(StageRole::Encode).send_attempts, 10);
        assert_eq!(RetryPolicy::for_role(StageRole::Upload).recv_attempts, 100);
        assert_eq!(RetryPolicy::for_role(StageRole::Scale).recv_attempts, 1_000_000);
        assert_eq!(
            RetryPolicy::for_role(StageRole::Decode).backoff,
            Duration::from_micros(100)
        );
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let err = fast(0, 1).validate().expect_err("zero send attempts");
        assert!(err.to_string().contains("at least one attempt"));
    }
}

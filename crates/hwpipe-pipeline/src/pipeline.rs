//! Synchronous three-phase orchestrator for a linear chain of stages.
//!
//! # Phases
//!
//! ```text
//!  STEADY ──► FLUSH_UPSTREAM ──► FLUSH_STAGE(1) … FLUSH_STAGE(N-2) ──► DRAIN_FINAL ──► DONE
//!  (input)     (stage 0)          (middle stages, in order)             (stage N-1)
//! ```
//!
//! 1. **Steady**: each input is pushed through every stage with one
//!    `send` + `receive` per stage.  Any status other than `Accepted` /
//!    `Ready` abandons the iteration; nothing is half-propagated.
//! 2. **Flush**: stage *k* gets `send(None)` then `receive()` until it
//!    reports end of stream (or, for middle stages, has nothing left).
//!    Whatever it emits is pushed through stages *k+1..N* as in steady
//!    state.
//! 3. **Drain**: the final stage is flushed the same way and everything it
//!    emits goes to the sink.
//!
//! Phases never overlap and run strictly in this order.  In a one-stage
//! pipeline the upstream flush already drains the final stage.
//!
//! # Errors
//!
//! Recoverable errors (see [`EngineError::is_recoverable`]) abandon the
//! current iteration and are counted.  Anything else ends the run and is
//! returned to the caller, which owns teardown.
//!
//! # Metrics
//!
//! [`PipelineMetrics`] keeps atomic per-stage counters and wall time; the
//! run ends with a [`PipelineReport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use hwpipe_core::codec_traits::{ArtifactSink, ArtifactSource};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::stage::{RecvStatus, SendStatus, StageRole, StageSession};
use hwpipe_core::types::Artifact;

/// Default bound on flush polls per phase.
pub const DEFAULT_MAX_FLUSH_POLLS: u32 = 4096;

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Steady,
    FlushUpstream,
    /// Flush of the middle stage at this index.
    FlushStage(usize),
    DrainFinal,
    Done,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Steady => f.write_str("steady"),
            Self::FlushUpstream => f.write_str("flush_upstream"),
            Self::FlushStage(i) => write!(f, "flush_stage_{i}"),
            Self::DrainFinal => f.write_str("drain_final"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Mutable run state; only the orchestrator touches it.
#[derive(Clone, Debug)]
pub struct PipelineState {
    pub phase: PipelinePhase,
    /// Artifacts written to the sink, across all phases.
    pub iterations: u64,
    /// Per stage: has it reported end of stream.
    pub end_of_stream: Vec<bool>,
}

impl PipelineState {
    fn new(stages: usize) -> Self {
        Self {
            phase: PipelinePhase::Steady,
            iterations: 0,
            end_of_stream: vec![false; stages],
        }
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on `send(None)` + `receive()` rounds per flush phase.
    pub max_flush_polls: u32,
    /// Promote a metrics invariant violation at the end of a run into an
    /// error instead of a warning.
    pub strict_invariants: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_flush_polls: DEFAULT_MAX_FLUSH_POLLS,
            strict_invariants: false,
        }
    }
}

// ─── Metrics ─────────────────────────────────────────────────────────────────

/// Counters for one stage position.
#[derive(Debug)]
pub struct StageCounters {
    pub role: StageRole,
    /// Inputs (including flush requests) the stage accepted.
    pub accepted: AtomicU64,
    /// Artifacts received from the stage.
    pub received: AtomicU64,
    /// Wall-clock time spent inside `send` and `receive`, microseconds.
    pub busy_us: AtomicU64,
    pub end_of_stream: AtomicBool,
}

impl StageCounters {
    fn new(role: StageRole) -> Self {
        Self {
            role,
            accepted: AtomicU64::new(0),
            received: AtomicU64::new(0),
            busy_us: AtomicU64::new(0),
            end_of_stream: AtomicBool::new(false),
        }
    }

    fn add_time(&self, since: Instant) {
        self.busy_us
            .fetch_add(since.elapsed().as_micros() as u64, Ordering::Relaxed);
    }
}

/// Why an iteration stopped before reaching the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonCause {
    /// A stage is buffering; its input is not lost.
    NeedMoreInput,
    /// A retry bound ran out; the input is dropped.
    RetryExhausted,
    /// A stage answered `TryAgain` without a retry layer; the input is dropped.
    Busy,
    /// A stage already ended its stream; the input is dropped.
    EndOfStream,
}

/// Atomic run counters.
#[derive(Debug)]
pub struct PipelineMetrics {
    pub inputs_read: AtomicU64,
    pub written: AtomicU64,
    pub abandoned_need_more_input: AtomicU64,
    pub abandoned_retry_exhausted: AtomicU64,
    pub abandoned_busy: AtomicU64,
    pub abandoned_end_of_stream: AtomicU64,
    pub stages: Vec<StageCounters>,
}

impl PipelineMetrics {
    pub fn new(roles: &[StageRole]) -> Arc<Self> {
        Arc::new(Self {
            inputs_read: AtomicU64::new(0),
            written: AtomicU64::new(0),
            abandoned_need_more_input: AtomicU64::new(0),
            abandoned_retry_exhausted: AtomicU64::new(0),
            abandoned_busy: AtomicU64::new(0),
            abandoned_end_of_stream: AtomicU64::new(0),
            stages: roles.iter().copied().map(StageCounters::new).collect(),
        })
    }

    fn abandon(&self, cause: AbandonCause) {
        let counter = match cause {
            AbandonCause::NeedMoreInput => &self.abandoned_need_more_input,
            AbandonCause::RetryExhausted => &self.abandoned_retry_exhausted,
            AbandonCause::Busy => &self.abandoned_busy,
            AbandonCause::EndOfStream => &self.abandoned_end_of_stream,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Inputs dropped for good (buffering stages are not counted).
    pub fn dropped(&self) -> u64 {
        self.abandoned_retry_exhausted.load(Ordering::Acquire)
            + self.abandoned_busy.load(Ordering::Acquire)
            + self.abandoned_end_of_stream.load(Ordering::Acquire)
    }

    /// No-duplication check: the sink never sees more than the final stage
    /// produced, and no stage emits more than the one before it accepted
    /// (stage 0 is bounded by its own accepts).  Holds at shutdown.
    pub fn validate(&self) -> bool {
        let Some(last) = self.stages.last() else {
            return true;
        };
        let written = self.written.load(Ordering::Acquire);
        written <= last.received.load(Ordering::Acquire)
            && self.stages.windows(2).all(|pair| {
                pair[1].received.load(Ordering::Acquire) <= pair[0].received.load(Ordering::Acquire)
            })
    }

    /// Log per-stage averages.
    pub fn report(&self) {
        for stage in &self.stages {
            let received = stage.received.load(Ordering::Relaxed);
            let busy = stage.busy_us.load(Ordering::Relaxed);
            info!(
                stage = %stage.role,
                accepted = stage.accepted.load(Ordering::Relaxed),
                received,
                avg_us = if received > 0 { busy / received } else { 0 },
                "Stage totals"
            );
        }
        info!(
            inputs = self.inputs_read.load(Ordering::Relaxed),
            written = self.written.load(Ordering::Relaxed),
            buffering = self.abandoned_need_more_input.load(Ordering::Relaxed),
            dropped = self.dropped(),
            "Pipeline totals"
        );
    }

    fn snapshot(&self) -> Vec<StageReport> {
        self.stages
            .iter()
            .map(|s| StageReport {
                role: s.role,
                accepted: s.accepted.load(Ordering::Acquire),
                received: s.received.load(Ordering::Acquire),
                busy_us: s.busy_us.load(Ordering::Acquire),
                end_of_stream: s.end_of_stream.load(Ordering::Acquire),
            })
            .collect()
    }
}

fn enforce_metrics_invariants(metrics: &PipelineMetrics, strict: bool) -> Result<()> {
    if metrics.validate() {
        return Ok(());
    }
    let counts: Vec<String> = metrics
        .stages
        .iter()
        .map(|s| format!("{}={}", s.role, s.received.load(Ordering::Acquire)))
        .collect();
    let msg = format!(
        "Pipeline duplication check failed: received [{}] written={}",
        counts.join(" "),
        metrics.written.load(Ordering::Acquire)
    );
    if strict {
        return Err(EngineError::InvariantViolation(msg));
    }
    warn!("{msg}");
    Ok(())
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub role: StageRole,
    pub accepted: u64,
    pub received: u64,
    pub busy_us: u64,
    pub end_of_stream: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropReport {
    pub need_more_input: u64,
    pub retry_exhausted: u64,
    pub busy: u64,
    pub end_of_stream: u64,
    pub flush_stalls: u64,
}

/// Summary of one run, serialisable for `--json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Artifacts written to the sink.
    pub iterations: u64,
    pub inputs_read: u64,
    pub stages: Vec<StageReport>,
    pub abandoned: DropReport,
    pub phases: Vec<PipelinePhase>,
    pub elapsed_ms: u64,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Outcome of pushing one artifact down the chain.
enum Push {
    Written,
    Abandoned(AbandonCause),
}

/// How a flush phase ended.
enum FlushEnd {
    EndOfStream,
    Idle,
    Stalled,
}

/// Drives a chain of [`StageSession`]s from a source to a sink.
pub struct Orchestrator {
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    state: PipelineState,
    phases: Vec<PipelinePhase>,
    flush_stalls: u64,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, roles: &[StageRole]) -> Self {
        Self {
            config,
            metrics: PipelineMetrics::new(roles),
            state: PipelineState::new(roles.len()),
            phases: Vec::new(),
            flush_stalls: 0,
        }
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    fn enter(&mut self, phase: PipelinePhase) {
        debug!(%phase, iterations = self.state.iterations, "Pipeline phase");
        self.state.phase = phase;
        self.phases.push(phase);
    }

    /// Run the whole lifecycle: steady state, flushes, drain.
    ///
    /// `stages` must match the roles given to [`Orchestrator::new`].  The
    /// sink is finished on success; on error nothing is finished and the
    /// caller tears down.
    #[instrument(skip_all, name = "pipeline_run", fields(stages = stages.len()))]
    pub fn run<S: StageSession>(
        &mut self,
        stages: &mut [S],
        source: &mut dyn ArtifactSource,
        sink: &mut dyn ArtifactSink,
    ) -> Result<PipelineReport> {
        if stages.is_empty() {
            return Err(EngineError::Pipeline("pipeline has no stages".into()));
        }
        if stages.len() != self.metrics.stages.len()
            || stages
                .iter()
                .zip(&self.metrics.stages)
                .any(|(s, c)| s.role() != c.role)
        {
            return Err(EngineError::InvariantViolation(
                "stage chain does not match the roles the orchestrator was built for".into(),
            ));
        }
        let started = Instant::now();
        let last = stages.len() - 1;

        self.enter(PipelinePhase::Steady);
        while let Some(input) = source.next_input()? {
            self.metrics.inputs_read.fetch_add(1, Ordering::Relaxed);
            self.push(stages, 0, input, sink)?;
        }

        self.enter(PipelinePhase::FlushUpstream);
        self.flush(stages, 0, sink)?;

        for k in 1..last {
            self.enter(PipelinePhase::FlushStage(k));
            self.flush(stages, k, sink)?;
        }

        if last > 0 {
            self.enter(PipelinePhase::DrainFinal);
            self.flush(stages, last, sink)?;
        }

        sink.finish()?;
        self.enter(PipelinePhase::Done);

        info!("Iterated {} times", self.state.iterations);
        self.metrics.report();
        enforce_metrics_invariants(&self.metrics, self.config.strict_invariants)?;

        Ok(self.report(started.elapsed()))
    }

    fn report(&self, elapsed: Duration) -> PipelineReport {
        let m = &self.metrics;
        PipelineReport {
            iterations: self.state.iterations,
            inputs_read: m.inputs_read.load(Ordering::Acquire),
            stages: m.snapshot(),
            abandoned: DropReport {
                need_more_input: m.abandoned_need_more_input.load(Ordering::Acquire),
                retry_exhausted: m.abandoned_retry_exhausted.load(Ordering::Acquire),
                busy: m.abandoned_busy.load(Ordering::Acquire),
                end_of_stream: m.abandoned_end_of_stream.load(Ordering::Acquire),
                flush_stalls: self.flush_stalls,
            },
            phases: self.phases.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn mark_eos(&mut self, k: usize) {
        self.state.end_of_stream[k] = true;
        self.metrics.stages[k].end_of_stream.store(true, Ordering::Release);
    }

    /// Recoverable errors become an abandon cause; the rest propagate.
    fn absorb(&self, k: usize, err: EngineError) -> Result<AbandonCause> {
        if !err.is_recoverable() {
            return Err(err);
        }
        warn!(stage = %self.metrics.stages[k].role, code = err.error_code(), error = %err, "Iteration abandoned");
        Ok(AbandonCause::RetryExhausted)
    }

    /// Push `artifact` into stage `from` and onward; write whatever falls
    /// out of the last stage.
    fn push<S: StageSession>(
        &mut self,
        stages: &mut [S],
        from: usize,
        mut artifact: Artifact,
        sink: &mut dyn ArtifactSink,
    ) -> Result<Push> {
        for k in from..stages.len() {
            let outcome = self.step(&mut stages[k], k, &artifact)?;
            match outcome {
                Ok(next) => artifact = next,
                Err(cause) => {
                    self.metrics.abandon(cause);
                    if cause == AbandonCause::EndOfStream {
                        self.mark_eos(k);
                    }
                    return Ok(Push::Abandoned(cause));
                }
            }
        }
        sink.write(artifact)?;
        self.state.iterations += 1;
        self.metrics.written.fetch_add(1, Ordering::Relaxed);
        Ok(Push::Written)
    }

    /// One `send` + `receive` on stage `k`.
    fn step<S: StageSession>(
        &self,
        stage: &mut S,
        k: usize,
        input: &Artifact,
    ) -> Result<std::result::Result<Artifact, AbandonCause>> {
        let counters = &self.metrics.stages[k];
        let t = Instant::now();
        let sent = stage.send(Some(input));
        counters.add_time(t);
        match sent {
            Ok(SendStatus::Accepted) => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SendStatus::NeedMoreInput) => return Ok(Err(AbandonCause::NeedMoreInput)),
            Ok(SendStatus::TryAgain) => return Ok(Err(AbandonCause::Busy)),
            Ok(SendStatus::EndOfStream) => return Ok(Err(AbandonCause::EndOfStream)),
            Err(e) => return self.absorb(k, e).map(Err),
        }

        let t = Instant::now();
        let received = stage.receive();
        counters.add_time(t);
        match received {
            Ok(RecvStatus::Ready(artifact)) => {
                counters.received.fetch_add(1, Ordering::Relaxed);
                Ok(Ok(artifact))
            }
            Ok(RecvStatus::NeedMoreInput) => Ok(Err(AbandonCause::NeedMoreInput)),
            Ok(RecvStatus::TryAgain) => Ok(Err(AbandonCause::Busy)),
            Ok(RecvStatus::EndOfStream) => Ok(Err(AbandonCause::EndOfStream)),
            Err(e) => self.absorb(k, e).map(Err),
        }
    }

    /// Flush stage `k`, pushing its output through the rest of the chain.
    fn flush<S: StageSession>(
        &mut self,
        stages: &mut [S],
        k: usize,
        sink: &mut dyn ArtifactSink,
    ) -> Result<()> {
        if self.state.end_of_stream[k] {
            debug!(stage = %stages[k].role(), "Stage already at end of stream, skipping flush");
            return Ok(());
        }
        let role = stages[k].role();
        let mut emitted = 0u64;
        let end = self.flush_loop(stages, k, sink, &mut emitted)?;
        match end {
            FlushEnd::EndOfStream => {
                self.mark_eos(k);
                debug!(stage = %role, emitted, "Flush reached end of stream");
            }
            FlushEnd::Idle => debug!(stage = %role, emitted, "Flush idle, no more output"),
            FlushEnd::Stalled => {
                self.flush_stalls += 1;
                let err = EngineError::FlushStalled {
                    stage: role,
                    polls: self.config.max_flush_polls,
                };
                warn!(code = err.error_code(), error = %err, emitted, "Moving to next phase");
            }
        }
        Ok(())
    }

    fn flush_loop<S: StageSession>(
        &mut self,
        stages: &mut [S],
        k: usize,
        sink: &mut dyn ArtifactSink,
        emitted: &mut u64,
    ) -> Result<FlushEnd> {
        for _ in 0..self.config.max_flush_polls {
            let t = Instant::now();
            let sent = stages[k].send(None);
            self.metrics.stages[k].add_time(t);
            match sent {
                Ok(SendStatus::EndOfStream) => return Ok(FlushEnd::EndOfStream),
                Ok(SendStatus::Accepted) => {
                    self.metrics.stages[k].accepted.fetch_add(1, Ordering::Relaxed);
                }
                Ok(SendStatus::TryAgain | SendStatus::NeedMoreInput) => {}
                Err(e) => {
                    let cause = self.absorb(k, e)?;
                    self.metrics.abandon(cause);
                    continue;
                }
            }

            let t = Instant::now();
            let received = stages[k].receive();
            self.metrics.stages[k].add_time(t);
            match received {
                Ok(RecvStatus::Ready(artifact)) => {
                    self.metrics.stages[k].received.fetch_add(1, Ordering::Relaxed);
                    *emitted += 1;
                    self.push(stages, k + 1, artifact, sink)?;
                }
                Ok(RecvStatus::EndOfStream) => return Ok(FlushEnd::EndOfStream),
                Ok(RecvStatus::NeedMoreInput) => return Ok(FlushEnd::Idle),
                Ok(RecvStatus::TryAgain) => {}
                Err(e) => {
                    let cause = self.absorb(k, e)?;
                    self.metrics.abandon(cause);
                }
            }
        }
        Ok(FlushEnd::Stalled)
    }
}

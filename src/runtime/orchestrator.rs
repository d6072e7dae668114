//! Orchestrator for one logical step of a plan.
//!
//! Brackets the stages with `lifecycle` markers, halts the chain when a stage
//! reports missing upstream data, retries retryable stage errors and records
//! failures in the ledger instead of raising them.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use crate::component::{Component, SignalPolicy, StepContext, StepOutcome};
use crate::core::{replay, Ledger, Payload, PayloadRegistry, ReplayBound};
use crate::domain::{
    lifecycle_kind, ErrorRecord, Event, EventDraft, EventFilter, LifecycleMarker, Namespace,
    RunHistory, RunRecord, RunState, TimeIndex,
};
use crate::error::{LedgerError, Result};

use super::plan::{Plan, RetryPolicy};

/// Tag on every orchestrator-written event.
pub const RUNTIME_TAG: &str = "runtime";

/// Register the payload types the runtime itself writes.
pub fn register_payloads(registry: &PayloadRegistry) -> Result<()> {
    registry.register::<LifecycleMarker>()?;
    registry.register::<ErrorRecord>()?;
    Ok(())
}

/// Deterministic key for one plan at one time index of one entity.
///
/// Format: `{plan}:{time_index}:{hash16}`
pub fn step_key(plan: &str, entity_id: &str, time_index: &TimeIndex) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(plan.as_bytes());
    hasher.update(b"\n");
    hasher.update(time_index.as_str().as_bytes());
    let digest = hasher.finalize();
    format!("{}:{}:{}", plan, time_index, hex::encode(&digest[..8]))
}

/// How one stage ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StepOutcome,
    pub attempts: u32,
    pub events_written: usize,
    pub duration_ms: u64,
}

/// Summary of one [`Orchestrator::run_step`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub plan: String,
    pub entity_id: String,
    pub step_key: String,
    pub time_index: TimeIndex,
    pub state: RunState,
    pub stages: Vec<StageReport>,
    pub halted_at: Option<String>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn events_written(&self) -> usize {
        self.stages.iter().map(|s| s.events_written).sum()
    }
}

/// A stage that exhausted its attempts.
struct StageFailure {
    stage: String,
    error: LedgerError,
    attempts: u32,
}

/// Runs plans against one ledger.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    ledger: Ledger,
    policy: SignalPolicy,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            policy: SignalPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_signal_policy(mut self, policy: SignalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Execute `plan` for `entity_id` at `time_index`.
    ///
    /// Stage failures are recorded as `error` and `lifecycle/error` events and
    /// reported through [`RunReport::state`]. Runtime writes are retried under
    /// the same policy as stages. `Err` is returned only when the plan is
    /// invalid or a lifecycle marker still cannot be written after retries.
    #[instrument(skip(self, plan, time_index), fields(plan = %plan.name()))]
    pub async fn run_step(
        &self,
        plan: &Plan,
        entity_id: &str,
        time_index: impl Into<TimeIndex>,
    ) -> Result<RunReport> {
        plan.validate()?;
        let time_index = time_index.into();
        let step_key = step_key(plan.name(), entity_id, &time_index);
        let mut state = RunState::Idle.transition(RunState::Running)?;

        info!(%step_key, %time_index, "Starting run");
        self.mark(
            entity_id,
            &step_key,
            &time_index,
            lifecycle_kind::START,
            &LifecycleMarker::start(plan.name()),
        )
        .await?;

        let mut stages = Vec::new();
        let mut halted: Option<(String, String)> = None;
        let mut failure: Option<StageFailure> = None;

        for stage in plan.stages() {
            match self
                .execute_stage_with_retry(stage.as_ref(), entity_id, &step_key, &time_index)
                .await
            {
                Ok(report) => {
                    let missing = match &report.outcome {
                        StepOutcome::Skipped { missing } => Some(missing.clone()),
                        _ => None,
                    };
                    stages.push(report);
                    if let Some(missing) = missing {
                        info!(stage = stage.name(), %missing, "Upstream data missing, halting run");
                        halted = Some((stage.name().to_string(), missing));
                        break;
                    }
                }
                Err(f) => {
                    failure = Some(f);
                    break;
                }
            }
        }

        let stages_run: Vec<String> = stages
            .iter()
            .filter(|s| !s.outcome.is_skipped())
            .map(|s| s.stage.clone())
            .collect();

        let mut marker = LifecycleMarker::start(plan.name());
        marker.stages_run = stages_run;

        match failure {
            Some(failure) => {
                state = self
                    .handle_run_failure(plan, entity_id, &step_key, &time_index, marker, failure)
                    .await?;
            }
            None => {
                if let Some((stage, missing)) = &halted {
                    marker.halted_at = Some(stage.clone());
                    marker.missing = Some(missing.clone());
                }
                self.mark(entity_id, &step_key, &time_index, lifecycle_kind::STOP, &marker)
                    .await?;
                state = state.transition(RunState::Completed)?;
                info!(%step_key, "Run completed");
            }
        }

        Ok(RunReport {
            plan: plan.name().to_string(),
            entity_id: entity_id.to_string(),
            step_key,
            time_index,
            state,
            stages,
            halted_at: halted.map(|(stage, _)| stage),
        })
    }

    /// Runs recorded for `entity_id`, oldest first.
    pub async fn run_history(&self, entity_id: &str) -> Result<Vec<RunRecord>> {
        let filter = EventFilter::entity(entity_id).namespace(Namespace::Lifecycle);
        let mut history = RunHistory::new();
        replay(&self.ledger.reader(), &filter, &ReplayBound::All, &mut history).await?;
        Ok(history.into_runs())
    }

    /// Execute a stage with retry logic
    async fn execute_stage_with_retry(
        &self,
        stage: &dyn Component,
        entity_id: &str,
        step_key: &str,
        time_index: &TimeIndex,
    ) -> std::result::Result<StageReport, StageFailure> {
        let mut attempt = 0u32;
        let mut events_written = 0;

        loop {
            attempt += 1;
            let stage_start = Instant::now();
            let ctx = StepContext::new(&self.ledger, stage, entity_id, step_key, time_index.clone(), self.policy);

            let result = stage.step(&ctx).await;
            events_written += ctx.written().len();
            let duration_ms = stage_start.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    debug!(stage = stage.name(), ?outcome, duration_ms, "Stage finished");
                    return Ok(StageReport {
                        stage: stage.name().to_string(),
                        outcome,
                        attempts: attempt,
                        events_written,
                        duration_ms,
                    });
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        stage = stage.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(stage = stage.name(), attempt, error = %e, "Stage failed permanently");
                    return Err(StageFailure {
                        stage: stage.name().to_string(),
                        error: e,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Record a failed run: an `error` record, then the terminal marker.
    async fn handle_run_failure(
        &self,
        plan: &Plan,
        entity_id: &str,
        step_key: &str,
        time_index: &TimeIndex,
        mut marker: LifecycleMarker,
        failure: StageFailure,
    ) -> Result<RunState> {
        let error_kind = failure.error.kind();
        let message = failure.error.to_string();
        error!(%step_key, stage = %failure.stage, %error_kind, %message, "Run failed");

        let record = ErrorRecord {
            plan: plan.name().to_string(),
            stage: Some(failure.stage.clone()),
            error_kind,
            message: message.clone(),
            attempts: failure.attempts,
        };
        // The terminal marker below carries the same facts, so losing this
        // record is not fatal.
        if let Err(e) = self
            .write(entity_id, step_key, time_index, Namespace::Error, "raised", &record)
            .await
        {
            warn!(error = %e, "Failed to record error event");
        }

        marker.error_kind = Some(error_kind);
        marker.message = Some(message.clone());
        marker.stage = Some(failure.stage);
        self.mark(entity_id, step_key, time_index, lifecycle_kind::ERROR, &marker)
            .await?;

        RunState::Running.transition(RunState::Failed { error_kind, message })
    }

    async fn mark(
        &self,
        entity_id: &str,
        step_key: &str,
        time_index: &TimeIndex,
        kind: &str,
        marker: &LifecycleMarker,
    ) -> Result<Event> {
        self.write(entity_id, step_key, time_index, Namespace::Lifecycle, kind, marker)
            .await
    }

    async fn write<T: Payload>(
        &self,
        entity_id: &str,
        step_key: &str,
        time_index: &TimeIndex,
        namespace: Namespace,
        kind: &str,
        payload: &T,
    ) -> Result<Event> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let draft = EventDraft::new(entity_id, namespace.clone(), kind, time_index.clone())
                .step_key(step_key)
                .tag(RUNTIME_TAG);

            match self.ledger.append_typed(draft, payload).await {
                Ok(event) => return Ok(event),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        %namespace,
                        kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Runtime write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

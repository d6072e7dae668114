//! Orchestration runs and their reconstruction from lifecycle events.
//!
//! A run is one execution of a plan for one entity at one `time_index`. Its
//! state is never stored directly; it is derived by replaying the
//! `lifecycle` events the orchestrator wrote for its `step_key`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Payload, PayloadRegistry, Projection};
use crate::error::{ErrorKind, LedgerError, Result};

use super::event::{Event, Namespace, TimeIndex};

/// `kind` values used in the lifecycle namespace.
pub mod lifecycle_kind {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const ERROR: &str = "error";
}

/// Payload of every `lifecycle` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleMarker {
    /// Plan being executed
    pub plan: String,

    /// Stages that ran to completion before this marker
    #[serde(default)]
    pub stages_run: Vec<String>,

    /// Stage that halted the chain for lack of upstream data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<String>,

    /// What the halting stage was waiting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<String>,

    /// Classification of the failure (error markers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Failure message (error markers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Stage that failed (error markers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl Payload for LifecycleMarker {
    const PAYLOAD_TYPE: &'static str = "Lifecycle";
}

impl LifecycleMarker {
    pub fn start(plan: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            stages_run: Vec::new(),
            halted_at: None,
            missing: None,
            error_kind: None,
            message: None,
            stage: None,
        }
    }
}

/// Payload of `error` namespace records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub plan: String,
    pub stage: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
    /// Attempts made before giving up
    pub attempts: u32,
}

impl Payload for ErrorRecord {
    const PAYLOAD_TYPE: &'static str = "ErrorRecord";
}

/// State of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Not yet started
    Idle,

    /// Stages executing
    Running,

    /// All stages ran, or the chain halted gracefully
    Completed,

    /// Aborted by an error
    Failed { error_kind: ErrorKind, message: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RunState {
    fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// `Idle -> Running -> {Completed, Failed}`; terminal states are final.
    pub fn transition(&self, next: RunState) -> Result<RunState> {
        let allowed = matches!(
            (self, &next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed { .. })
        );
        if allowed {
            Ok(next)
        } else {
            Err(LedgerError::InvalidStateTransition {
                from: self.label().to_string(),
                to: next.label().to_string(),
            })
        }
    }
}

/// One run, as reconstructed from its lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub entity_id: String,
    pub step_key: String,
    pub plan: String,
    pub time_index: TimeIndex,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages_run: Vec<String>,
    pub halted_at: Option<String>,
}

impl RunRecord {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Projection collecting every run found in a lifecycle stream, in order.
///
/// Markers that break the state machine (a stop with no start, say) are
/// skipped with a warning rather than failing the replay.
#[derive(Debug, Default)]
pub struct RunHistory {
    runs: Vec<RunRecord>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    pub fn into_runs(self) -> Vec<RunRecord> {
        self.runs
    }

    /// The most recently started run.
    pub fn last(&self) -> Option<&RunRecord> {
        self.runs.last()
    }

    fn find_open(&mut self, entity_id: &str, step_key: &str) -> Option<&mut RunRecord> {
        self.runs
            .iter_mut()
            .rev()
            .find(|r| r.entity_id == entity_id && r.step_key == step_key && !r.is_finished())
    }
}

impl Projection for RunHistory {
    fn apply(&mut self, event: &Event, registry: &PayloadRegistry) -> Result<()> {
        if event.namespace() != &Namespace::Lifecycle {
            return Ok(());
        }
        let marker: LifecycleMarker = registry.decode(event)?;

        match event.kind() {
            lifecycle_kind::START => {
                let state = RunState::Idle.transition(RunState::Running)?;
                self.runs.push(RunRecord {
                    entity_id: event.entity_id().to_string(),
                    step_key: event.step_key().to_string(),
                    plan: marker.plan,
                    time_index: event.time_index().clone(),
                    state,
                    started_at: event.timestamp(),
                    finished_at: None,
                    stages_run: Vec::new(),
                    halted_at: None,
                });
            }
            lifecycle_kind::STOP | lifecycle_kind::ERROR => {
                let next = if event.kind() == lifecycle_kind::STOP {
                    RunState::Completed
                } else {
                    RunState::Failed {
                        error_kind: marker.error_kind.unwrap_or(ErrorKind::ComponentFailed),
                        message: marker.message.clone().unwrap_or_default(),
                    }
                };
                match self.find_open(event.entity_id(), event.step_key()) {
                    Some(run) => {
                        run.state = run.state.transition(next)?;
                        run.finished_at = Some(event.timestamp());
                        run.stages_run = marker.stages_run;
                        run.halted_at = marker.halted_at;
                    }
                    None => {
                        tracing::warn!(
                            step_key = event.step_key(),
                            kind = event.kind(),
                            "Lifecycle marker without a matching start, ignoring"
                        );
                    }
                }
            }
            other => {
                tracing::warn!(kind = other, "Unknown lifecycle kind, ignoring");
            }
        }
        Ok(())
    }
}

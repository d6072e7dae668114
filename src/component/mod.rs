//! The component protocol.
//!
//! Every pipeline stage reads a filtered view of the ledger, computes a
//! result and appends it under its own namespace. Stages never reference
//! each other; they coordinate purely through the events they leave behind.

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Ledger, LedgerReader, Payload};
use crate::domain::{Event, EventDraft, EventFilter, Namespace, TimeIndex, TimeRange};
use crate::error::{LedgerError, Result};

/// Position of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Records raw observations
    Observer,
    /// Derives statistics from observations
    Statistic,
    /// Computes boundaries and thresholds
    Criteria,
    /// Decides whether to stop
    Signaler,
    /// Advises on a decision
    Recommender,
}

impl Role {
    /// Dependency rank; a plan must run stages in non-decreasing rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Observer => 0,
            Self::Statistic => 1,
            Self::Criteria => 2,
            Self::Signaler | Self::Recommender => 3,
        }
    }

    /// The namespace a stage of this role writes by default.
    pub fn namespace(&self) -> Namespace {
        match self {
            Self::Observer => Namespace::Observation,
            Self::Statistic => Namespace::Statistic,
            Self::Criteria => Namespace::Criteria,
            Self::Signaler | Self::Recommender => Namespace::Signal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::Statistic => "statistic",
            Self::Criteria => "criteria",
            Self::Signaler => "signaler",
            Self::Recommender => "recommender",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace, kind and tag a stage writes under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLabels {
    pub namespace: Namespace,
    pub kind: String,
    pub tag: String,
}

impl StageLabels {
    pub fn for_role(role: Role) -> Self {
        let (kind, tag) = match role {
            Role::Observer => ("observation", "obs"),
            Role::Statistic => ("updated", "stat:generic"),
            Role::Criteria => ("updated", "crit:generic"),
            Role::Signaler => ("decision", "signal:generic"),
            Role::Recommender => ("recommendation", "signal:generic"),
        };
        Self {
            namespace: role.namespace(),
            kind: kind.to_string(),
            tag: tag.to_string(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// What a stage did during one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepOutcome {
    /// Wrote at least one event
    Advanced,

    /// Ran, and decided there was nothing to write
    Quiet,

    /// A required upstream event was absent; the rest of the chain halts
    Skipped { missing: String },
}

impl StepOutcome {
    pub fn skipped(missing: impl Into<String>) -> Self {
        Self::Skipped {
            missing: missing.into(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Whether decision stages should log "continue" decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalPolicy {
    #[serde(default)]
    pub record_continue: bool,
}

/// Result of looking up a required upstream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream<T> {
    Ready(T),
    /// Not yet available; return this outcome from `step`
    Missing(StepOutcome),
}

/// A pipeline stage.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique name within a plan
    fn name(&self) -> &str;

    fn role(&self) -> Role;

    /// Namespaces this stage may append to.
    fn writes(&self) -> Vec<Namespace> {
        vec![self.role().namespace()]
    }

    /// Advance the ledger for `ctx.entity_id()` at `ctx.time_index()`.
    ///
    /// Must tolerate missing upstream data by returning
    /// [`StepOutcome::Skipped`], and must be deterministic given the same
    /// ledger contents.
    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome>;
}

/// Everything a stage sees during one step.
///
/// Reads go through [`StepContext::reader`]. Writes go through
/// [`StepContext::append`] or [`StepContext::emit`], which stamp the step's
/// entity, key and time and refuse namespaces the stage does not own.
pub struct StepContext {
    ledger: Ledger,
    reader: LedgerReader,
    component: String,
    writes: Vec<Namespace>,
    entity_id: String,
    step_key: String,
    time_index: TimeIndex,
    policy: SignalPolicy,
    written: Mutex<Vec<Event>>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("component", &self.component)
            .field("entity_id", &self.entity_id)
            .field("step_key", &self.step_key)
            .field("time_index", &self.time_index)
            .finish_non_exhaustive()
    }
}

impl StepContext {
    pub fn new(
        ledger: &Ledger,
        component: &dyn Component,
        entity_id: impl Into<String>,
        step_key: impl Into<String>,
        time_index: impl Into<TimeIndex>,
        policy: SignalPolicy,
    ) -> Self {
        Self {
            ledger: ledger.clone(),
            reader: ledger.reader(),
            component: component.name().to_string(),
            writes: component.writes(),
            entity_id: entity_id.into(),
            step_key: step_key.into(),
            time_index: time_index.into(),
            policy,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn reader(&self) -> &LedgerReader {
        &self.reader
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn step_key(&self) -> &str {
        &self.step_key
    }

    pub fn time_index(&self) -> &TimeIndex {
        &self.time_index
    }

    pub fn policy(&self) -> SignalPolicy {
        self.policy
    }

    /// Filter over this entity's events up to and including this step's time.
    pub fn visible(&self) -> EventFilter {
        EventFilter::entity(self.entity_id.clone())
            .time_range(TimeRange::up_to(self.time_index.clone()))
    }

    /// Latest visible event matching `filter`, decoded as `T`.
    ///
    /// The entity and time bounds of `filter` are replaced by the step's own.
    pub async fn require_latest<T: Payload>(
        &self,
        filter: EventFilter,
        missing: &str,
    ) -> Result<Upstream<T>> {
        let scoped = EventFilter {
            entity_id: Some(self.entity_id.clone()),
            time_range: TimeRange::up_to(self.time_index.clone()),
            ..filter
        };
        match self.reader.latest_decoded::<T>(&scoped).await? {
            Some(value) => Ok(Upstream::Ready(value)),
            None => {
                debug!(component = %self.component, missing, "Upstream event not yet available");
                Ok(Upstream::Missing(StepOutcome::skipped(missing)))
            }
        }
    }

    /// A draft stamped with this step's entity, key and time.
    pub fn draft(&self, namespace: impl Into<Namespace>, kind: impl Into<String>) -> EventDraft {
        EventDraft::new(
            self.entity_id.clone(),
            namespace,
            kind,
            self.time_index.clone(),
        )
        .step_key(self.step_key.clone())
    }

    /// Append a draft after checking namespace ownership and step scope.
    pub async fn append(&self, draft: EventDraft) -> Result<Event> {
        if draft.namespace.is_runtime_owned() || !self.writes.contains(&draft.namespace) {
            return Err(LedgerError::UnauthorizedNamespace {
                component: self.component.clone(),
                namespace: draft.namespace.to_string(),
            });
        }
        if draft.entity_id != self.entity_id {
            return Err(LedgerError::invalid_draft(format!(
                "component '{}' is scoped to entity '{}', not '{}'",
                self.component, self.entity_id, draft.entity_id
            )));
        }

        let event = self.ledger.append(draft).await?;
        self.written.lock().push(event.clone());
        Ok(event)
    }

    /// Encode `payload` and append it under `namespace`/`kind`/`tag`.
    pub async fn emit<T: Payload>(
        &self,
        namespace: impl Into<Namespace>,
        kind: impl Into<String>,
        tag: impl Into<String>,
        payload: &T,
    ) -> Result<Event> {
        let value = self.reader.registry().encode(payload)?;
        let draft = self
            .draft(namespace, kind)
            .tag(tag)
            .payload(T::PAYLOAD_TYPE, value);
        self.append(draft).await
    }

    /// [`emit`](Self::emit) using a stage's labels.
    pub async fn emit_labeled<T: Payload>(&self, labels: &StageLabels, payload: &T) -> Result<Event> {
        self.emit(
            labels.namespace.clone(),
            labels.kind.clone(),
            labels.tag.clone(),
            payload,
        )
        .await
    }

    /// Events appended through this context so far.
    pub fn written(&self) -> Vec<Event> {
        self.written.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryStore, PayloadRegistry};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Mean {
        value: f64,
    }

    impl Payload for Mean {
        const PAYLOAD_TYPE: &'static str = "Mean";
    }

    struct MeanStage;

    #[async_trait]
    impl Component for MeanStage {
        fn name(&self) -> &str {
            "mean"
        }

        fn role(&self) -> Role {
            Role::Statistic
        }

        async fn step(&self, ctx: &StepContext) -> Result<StepOutcome> {
            ctx.emit(Namespace::Statistic, "updated", "stat:mean", &Mean { value: 1.0 })
                .await?;
            Ok(StepOutcome::Advanced)
        }
    }

    fn ledger() -> Ledger {
        let registry = PayloadRegistry::with_builtins().unwrap();
        registry.register::<Mean>().unwrap();
        Ledger::new(Arc::new(MemoryStore::new()), Arc::new(registry))
    }

    #[test]
    fn test_role_order_and_namespaces() {
        assert!(Role::Observer.rank() < Role::Statistic.rank());
        assert!(Role::Criteria.rank() < Role::Signaler.rank());
        assert_eq!(Role::Signaler.rank(), Role::Recommender.rank());
        assert_eq!(Role::Criteria.namespace(), Namespace::Criteria);
        assert_eq!(StageLabels::for_role(Role::Statistic).tag, "stat:generic");
        assert_eq!(StageLabels::for_role(Role::Criteria).tag, "crit:generic");
    }

    #[tokio::test]
    async fn test_emit_stamps_step_scope() {
        let ledger = ledger();
        let ctx = StepContext::new(&ledger, &MeanStage, "exp#1", "k1", "t002", SignalPolicy::default());

        let outcome = MeanStage.step(&ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advanced);

        let written = ctx.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].entity_id(), "exp#1");
        assert_eq!(written[0].step_key(), "k1");
        assert_eq!(written[0].time_index().as_str(), "t002");
        assert_eq!(written[0].payload_type(), "Mean");
    }

    #[tokio::test]
    async fn test_foreign_namespace_is_refused() {
        let ledger = ledger();
        let ctx = StepContext::new(&ledger, &MeanStage, "exp#1", "k1", "t001", SignalPolicy::default());

        for ns in [Namespace::Signal, Namespace::Lifecycle] {
            let err = ctx
                .append(ctx.draft(ns, "emitted").payload("Mean", json!({"value": 1.0})))
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::UnauthorizedNamespace { .. }));
        }
        assert!(ctx.written().is_empty());
    }

    #[tokio::test]
    async fn test_require_latest_ignores_future_events() {
        let ledger = ledger();
        let later = StepContext::new(&ledger, &MeanStage, "exp#1", "k2", "t005", SignalPolicy::default());
        MeanStage.step(&later).await.unwrap();

        let earlier = StepContext::new(&ledger, &MeanStage, "exp#1", "k1", "t001", SignalPolicy::default());
        let upstream = earlier
            .require_latest::<Mean>(EventFilter::any().tag("stat:mean"), "mean")
            .await
            .unwrap();
        assert_eq!(upstream, Upstream::Missing(StepOutcome::skipped("mean")));

        let upstream = later
            .require_latest::<Mean>(EventFilter::any().tag("stat:mean"), "mean")
            .await
            .unwrap();
        assert_eq!(upstream, Upstream::Ready(Mean { value: 1.0 }));
    }
}

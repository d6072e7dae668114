//! Event types for the append-only ledger.
//!
//! All state is recorded as immutable events. An [`EventDraft`] carries every
//! field the caller controls; the store materializes it into an [`Event`] by
//! assigning the identity and sequence number.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Coarse event category. Determines which components may write the event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Namespace {
    /// Experimental design / configuration
    Design,
    /// Raw observations
    Observation,
    /// Derived statistics
    Statistic,
    /// Boundaries, thresholds, critical values
    Criteria,
    /// Decisions and recommendations
    Signal,
    /// Orchestrator run markers
    Lifecycle,
    /// Orchestrator error records
    Error,
    /// Anything else
    Custom(String),
}

impl Namespace {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Design => "design",
            Self::Observation => "obs",
            Self::Statistic => "stats",
            Self::Criteria => "criteria",
            Self::Signal => "signals",
            Self::Lifecycle => "lifecycle",
            Self::Error => "error",
            Self::Custom(name) => name,
        }
    }

    /// Namespaces only the orchestrator may write.
    pub fn is_runtime_owned(&self) -> bool {
        matches!(self, Self::Lifecycle | Self::Error)
    }
}

impl From<String> for Namespace {
    fn from(value: String) -> Self {
        match value.as_str() {
            "design" => Self::Design,
            "obs" => Self::Observation,
            "stats" => Self::Statistic,
            "criteria" => Self::Criteria,
            "signals" => Self::Signal,
            "lifecycle" => Self::Lifecycle,
            "error" => Self::Error,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        match value {
            Namespace::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical experiment time. Ordered lexicographically, never by wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeIndex(String);

impl TimeIndex {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Index for the n-th analysis look: `t001`, `t002`, ...
    ///
    /// Zero-padded so that lexical order matches look order.
    pub fn look(n: u32) -> Self {
        Self(format!("t{:03}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TimeIndex {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TimeIndex {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TimeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single immutable record in the ledger.
///
/// Fields are read-only; the only way to create one is
/// [`crate::core::LedgerStore::append`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    time_index: TimeIndex,
    timestamp: DateTime<Utc>,
    namespace: Namespace,
    kind: String,
    entity_id: String,
    step_key: String,
    snapshot_id: Option<String>,
    tag: Option<String>,
    payload_type: String,
    payload: Map<String, Value>,

    /// Store-assigned append order; re-derived by file backends on load
    #[serde(skip)]
    sequence: u64,
}

impl Event {
    /// Materialize a validated draft. Only stores call this.
    pub(crate) fn materialize(draft: EventDraft, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            time_index: draft.time_index,
            timestamp: draft.timestamp,
            namespace: draft.namespace,
            kind: draft.kind,
            entity_id: draft.entity_id,
            step_key: draft.step_key,
            snapshot_id: draft.snapshot_id,
            tag: draft.tag,
            payload_type: draft.payload_type,
            payload: match draft.payload {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            sequence,
        }
    }

    /// Attach the sequence number derived while loading a persisted log.
    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn time_index(&self) -> &TimeIndex {
        &self.time_index
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn step_key(&self) -> &str {
        &self.step_key
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshot_id.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Total-order key within an entity: `(time_index, sequence)`.
    pub fn position(&self) -> (&TimeIndex, u64) {
        (&self.time_index, self.sequence)
    }
}

/// Everything about an event except its identity and sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub entity_id: String,
    pub namespace: Namespace,
    pub kind: String,
    pub time_index: TimeIndex,
    pub step_key: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot_id: Option<String>,
    pub tag: Option<String>,
    pub payload_type: String,
    pub payload: Value,
}

impl EventDraft {
    /// Start a draft stamped with the current wall-clock time.
    pub fn new(
        entity_id: impl Into<String>,
        namespace: impl Into<Namespace>,
        kind: impl Into<String>,
        time_index: impl Into<TimeIndex>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            namespace: namespace.into(),
            kind: kind.into(),
            time_index: time_index.into(),
            step_key: String::new(),
            timestamp: Utc::now(),
            snapshot_id: None,
            tag: None,
            payload_type: String::new(),
            payload: Value::Object(Map::new()),
        }
    }

    pub fn step_key(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = step_key.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach an untyped payload. Any payload type is accepted here; only
    /// typed reads require a registered codec.
    pub fn payload(mut self, payload_type: impl Into<String>, payload: Value) -> Self {
        self.payload_type = payload_type.into();
        self.payload = payload;
        self
    }

    /// Structural checks performed before a draft may reach a store.
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.is_empty() {
            return Err(LedgerError::invalid_draft("entity_id cannot be empty"));
        }
        if self.namespace.as_str().is_empty() {
            return Err(LedgerError::invalid_draft("namespace cannot be empty"));
        }
        if self.kind.is_empty() {
            return Err(LedgerError::invalid_draft("kind cannot be empty"));
        }
        if self.time_index.as_str().is_empty() {
            return Err(LedgerError::invalid_draft("time_index cannot be empty"));
        }
        if self.step_key.is_empty() {
            return Err(LedgerError::invalid_draft("step_key cannot be empty"));
        }
        if self.payload_type.is_empty() {
            return Err(LedgerError::invalid_draft("payload_type cannot be empty"));
        }
        if !self.payload.is_object() {
            return Err(LedgerError::invalid_draft(format!(
                "{} payload must be a JSON object",
                self.payload_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> EventDraft {
        EventDraft::new("exp#1", Namespace::Observation, "observation", "t001")
            .step_key("look-1")
            .tag("obs")
            .payload("TwoPropObsBatch", json!({"nA": 10, "nB": 10, "mA": 8, "mB": 1}))
    }

    #[test]
    fn test_namespace_string_round_trip() {
        for ns in [
            Namespace::Design,
            Namespace::Observation,
            Namespace::Statistic,
            Namespace::Criteria,
            Namespace::Signal,
            Namespace::Lifecycle,
            Namespace::Error,
            Namespace::Custom("audit".to_string()),
        ] {
            let json = serde_json::to_string(&ns).unwrap();
            let parsed: Namespace = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, ns);
        }
        assert_eq!(serde_json::to_string(&Namespace::Statistic).unwrap(), "\"stats\"");
    }

    #[test]
    fn test_time_index_look_sorts_lexically() {
        assert_eq!(TimeIndex::look(2).as_str(), "t002");
        assert!(TimeIndex::look(9) < TimeIndex::look(10));
        assert!(TimeIndex::from("t002") < TimeIndex::from("t003"));
    }

    #[test]
    fn test_valid_draft_passes() {
        assert!(draft().validate().is_ok());
    }

    #[test]
    fn test_draft_rejects_missing_fields() {
        let no_step = EventDraft::new("exp#1", Namespace::Observation, "observation", "t001")
            .payload("X", json!({}));
        assert!(matches!(
            no_step.validate(),
            Err(LedgerError::InvalidDraft { .. })
        ));

        let no_type = EventDraft::new("exp#1", Namespace::Observation, "observation", "t001")
            .step_key("s1");
        assert!(no_type.validate().is_err());

        let no_entity = EventDraft::new("", Namespace::Observation, "observation", "t001")
            .step_key("s1")
            .payload("X", json!({}));
        assert!(no_entity.validate().is_err());
    }

    #[test]
    fn test_draft_rejects_non_object_payload() {
        let bad = draft().payload("TwoPropObsBatch", json!([1, 2, 3]));
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[test]
    fn test_persisted_shape_has_exact_fields() {
        let event = Event::materialize(draft(), 7);
        let value = serde_json::to_value(&event).unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();

        assert_eq!(
            keys,
            vec![
                "entity_id",
                "id",
                "kind",
                "namespace",
                "payload",
                "payload_type",
                "snapshot_id",
                "step_key",
                "tag",
                "time_index",
                "timestamp",
            ]
        );
    }

    #[test]
    fn test_materialized_event_keeps_draft_fields() {
        let event = Event::materialize(draft(), 3);

        assert_eq!(event.entity_id(), "exp#1");
        assert_eq!(event.namespace(), &Namespace::Observation);
        assert_eq!(event.step_key(), "look-1");
        assert_eq!(event.tag(), Some("obs"));
        assert_eq!(event.sequence(), 3);
        assert_eq!(event.payload()["mA"], json!(8));
    }
}

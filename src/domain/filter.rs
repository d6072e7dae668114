//! Query filters over the ledger.
//!
//! A filter is a conjunction: every field that is set must match. An empty
//! filter matches every event.

use std::ops::Bound;

use super::event::{Event, Namespace, TimeIndex};

/// Inclusive/exclusive bounds on `time_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Bound<TimeIndex>,
    pub end: Bound<TimeIndex>,
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::all()
    }
}

impl TimeRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// `start <= t <= end`
    pub fn inclusive(start: impl Into<TimeIndex>, end: impl Into<TimeIndex>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Included(end.into()),
        }
    }

    /// `t <= end`
    pub fn up_to(end: impl Into<TimeIndex>) -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Included(end.into()),
        }
    }

    /// `t < end`
    pub fn before(end: impl Into<TimeIndex>) -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Excluded(end.into()),
        }
    }

    /// `t > start`
    pub fn after(start: impl Into<TimeIndex>) -> Self {
        Self {
            start: Bound::Excluded(start.into()),
            end: Bound::Unbounded,
        }
    }

    pub fn contains(&self, t: &TimeIndex) -> bool {
        let above = match &self.start {
            Bound::Included(s) => t >= s,
            Bound::Excluded(s) => t > s,
            Bound::Unbounded => true,
        };
        let below = match &self.end {
            Bound::Included(e) => t <= e,
            Bound::Excluded(e) => t < e,
            Bound::Unbounded => true,
        };
        above && below
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(
            (&self.start, &self.end),
            (Bound::Unbounded, Bound::Unbounded)
        )
    }

    /// Bounds expressed over `(time_index, sequence)` keys.
    pub(crate) fn key_bounds(&self) -> (Bound<(TimeIndex, u64)>, Bound<(TimeIndex, u64)>) {
        let start = match &self.start {
            Bound::Included(t) => Bound::Included((t.clone(), 0)),
            Bound::Excluded(t) => Bound::Excluded((t.clone(), u64::MAX)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let end = match &self.end {
            Bound::Included(t) => Bound::Included((t.clone(), u64::MAX)),
            Bound::Excluded(t) => Bound::Excluded((t.clone(), 0)),
            Bound::Unbounded => Bound::Unbounded,
        };
        (start, end)
    }

    /// True when no time index can satisfy the bounds.
    pub(crate) fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }
}

/// Conjunctive filter over events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub entity_id: Option<String>,
    pub namespace: Option<Namespace>,
    pub kind: Option<String>,
    pub tag: Option<String>,
    pub payload_type: Option<String>,
    pub time_range: TimeRange,
}

impl EventFilter {
    /// Matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Scoped to one entity.
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<Namespace>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = range;
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.entity_id
            .as_deref()
            .map_or(true, |e| event.entity_id() == e)
            && self
                .namespace
                .as_ref()
                .map_or(true, |ns| event.namespace() == ns)
            && self.kind.as_deref().map_or(true, |k| event.kind() == k)
            && self.tag.as_deref().map_or(true, |t| event.tag() == Some(t))
            && self
                .payload_type
                .as_deref()
                .map_or(true, |p| event.payload_type() == p)
            && self.time_range.contains(event.time_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventDraft;
    use serde_json::json;

    fn event_at(t: &str, ns: Namespace, tag: &str) -> Event {
        let draft = EventDraft::new("exp#1", ns, "updated", t)
            .step_key("s1")
            .tag(tag)
            .payload("WaldZ", json!({"z": 1.0}));
        Event::materialize(draft, 1)
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let event = event_at("t001", Namespace::Statistic, "stat:waldz");
        assert!(EventFilter::any().matches(&event));
    }

    #[test]
    fn test_filter_is_a_conjunction() {
        let event = event_at("t001", Namespace::Statistic, "stat:waldz");

        let hit = EventFilter::entity("exp#1")
            .namespace(Namespace::Statistic)
            .tag("stat:waldz")
            .payload_type("WaldZ");
        assert!(hit.matches(&event));

        let wrong_tag = EventFilter::entity("exp#1")
            .namespace(Namespace::Statistic)
            .tag("stat:other");
        assert!(!wrong_tag.matches(&event));

        assert!(!EventFilter::entity("exp#2").matches(&event));
    }

    #[test]
    fn test_untagged_event_fails_tag_filter() {
        let draft = EventDraft::new("exp#1", Namespace::Statistic, "updated", "t001")
            .step_key("s1")
            .payload("WaldZ", json!({}));
        let event = Event::materialize(draft, 1);
        assert!(!EventFilter::any().tag("stat:waldz").matches(&event));
    }

    #[test]
    fn test_time_range_bounds() {
        let t2 = TimeIndex::from("t002");

        assert!(TimeRange::inclusive("t002", "t002").contains(&t2));
        assert!(TimeRange::up_to("t002").contains(&t2));
        assert!(!TimeRange::before("t002").contains(&t2));
        assert!(!TimeRange::after("t002").contains(&t2));
        assert!(TimeRange::after("t001").contains(&t2));
        assert!(TimeRange::all().contains(&t2));
    }

    #[test]
    fn test_empty_ranges_are_detected() {
        assert!(TimeRange::inclusive("t003", "t002").is_empty());
        assert!(!TimeRange::inclusive("t002", "t002").is_empty());
        let half_open = TimeRange {
            start: Bound::Included(TimeIndex::from("t002")),
            end: Bound::Excluded(TimeIndex::from("t002")),
        };
        assert!(half_open.is_empty());
    }
}

//! In-memory ledger backend.
//!
//! Events are partitioned by entity. Each partition is an ordered map keyed
//! by `(time_index, sequence)`, so scans come out in ledger order without a
//! sort. Appends to different entities only share the brief partition lookup
//! and the sequence counter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::trace;

use crate::domain::{Event, EventDraft, EventFilter, TimeIndex};
use crate::error::Result;

use super::store::{EventStream, LedgerStore};

type Partition = BTreeMap<(TimeIndex, u64), Event>;

/// Process-local store. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Arc<RwLock<Partition>>>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities with at least one event, sorted.
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn partition(&self, entity_id: &str) -> Arc<RwLock<Partition>> {
        if let Some(partition) = self.partitions.read().get(entity_id) {
            return Arc::clone(partition);
        }
        let mut partitions = self.partitions.write();
        Arc::clone(partitions.entry(entity_id.to_string()).or_default())
    }

    /// Visit every event matching `filter` as of one instant.
    ///
    /// Read guards on all candidate partitions are taken, in entity order,
    /// while the partition map is held, so no partition can appear or gain an
    /// event mid-scan. Sequence numbers are assigned under partition write
    /// locks, hence the visited events are exactly those with sequence up to
    /// some bound.
    fn scan<F>(&self, filter: &EventFilter, mut visit: F)
    where
        F: FnMut(&Event),
    {
        if filter.time_range.is_empty() {
            return;
        }

        let map = self.partitions.read();
        let mut candidates: Vec<(&String, Arc<RwLock<Partition>>)> = match &filter.entity_id {
            Some(entity_id) => map
                .get_key_value(entity_id)
                .map(|(k, p)| (k, Arc::clone(p)))
                .into_iter()
                .collect(),
            None => map.iter().map(|(k, p)| (k, Arc::clone(p))).collect(),
        };
        candidates.sort_by(|a, b| a.0.cmp(b.0));
        let guards: Vec<RwLockReadGuard<'_, Partition>> =
            candidates.iter().map(|(_, p)| p.read()).collect();

        let bounds = filter.time_range.key_bounds();
        for partition in &guards {
            for event in partition.range(bounds.clone()).map(|(_, e)| e) {
                if filter.matches(event) {
                    visit(event);
                }
            }
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append(&self, draft: EventDraft) -> Result<Event> {
        draft.validate()?;
        let partition = self.partition(&draft.entity_id);

        // Sequence is assigned under the partition lock so that, within an
        // entity, sequence order is insertion order.
        let mut partition = partition.write();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event::materialize(draft, sequence);
        partition.insert((event.time_index().clone(), sequence), event.clone());

        trace!(
            entity_id = event.entity_id(),
            namespace = %event.namespace(),
            sequence,
            "Appended event"
        );
        Ok(event)
    }

    async fn iterate(&self, filter: &EventFilter) -> Result<EventStream> {
        let mut events = Vec::new();
        self.scan(filter, |event| events.push(event.clone()));
        if filter.entity_id.is_none() {
            events.sort_by(|a, b| a.position().cmp(&b.position()));
        }
        Ok(EventStream::new(events))
    }

    async fn count(&self, filter: &EventFilter) -> Result<usize> {
        let mut count = 0;
        self.scan(filter, |_| count += 1);
        Ok(count)
    }
}

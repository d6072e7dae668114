//! The ledger store contract.
//!
//! A store is append-only: it materializes drafts into events and serves
//! ordered, filtered scans. There is no update or delete primitive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::warn;

use crate::domain::{Event, EventDraft, EventFilter};
use crate::error::{LedgerError, Result};

/// Durable, ordered, append-only event persistence.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Validate `draft`, assign its id and sequence number and persist it.
    ///
    /// The returned event is visible to every read issued after this call
    /// returns.
    async fn append(&self, draft: EventDraft) -> Result<Event>;

    /// Events matching `filter`, ordered by `(time_index, sequence)`.
    async fn iterate(&self, filter: &EventFilter) -> Result<EventStream>;

    /// Number of events `iterate(filter)` would yield.
    async fn count(&self, filter: &EventFilter) -> Result<usize> {
        Ok(self.iterate(filter).await?.len())
    }
}

#[async_trait]
impl<S: LedgerStore + ?Sized> LedgerStore for Arc<S> {
    async fn append(&self, draft: EventDraft) -> Result<Event> {
        (**self).append(draft).await
    }

    async fn iterate(&self, filter: &EventFilter) -> Result<EventStream> {
        (**self).iterate(filter).await
    }

    async fn count(&self, filter: &EventFilter) -> Result<usize> {
        (**self).count(filter).await
    }
}

/// Result of [`LedgerStore::iterate`].
///
/// Holds a snapshot taken when the scan started, so appends made while the
/// stream is consumed are not observed. Events are handed out one at a time;
/// [`EventStream::rewind`] restarts from the first one.
#[derive(Debug, Clone)]
pub struct EventStream {
    events: Arc<[Event]>,
    position: usize,
}

impl EventStream {
    /// Wrap events already sorted by `(time_index, sequence)`.
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: events.into(),
            position: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Total number of events in the snapshot, consumed or not.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// The greatest event in the snapshot.
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }
}

impl Iterator for EventStream {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let event = self.events.get(self.position)?.clone();
        self.position += 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.events.len() - self.position;
        (remaining, Some(remaining))
    }
}

/// Bounds every operation of the wrapped store by a timeout.
///
/// An operation that does not finish in time fails with
/// [`LedgerError::StoreUnavailable`], leaving retry to the caller.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: LedgerStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn elapsed(&self, operation: &str, source: tokio::time::error::Elapsed) -> LedgerError {
        warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Store operation timed out");
        LedgerError::unavailable_with_source(
            format!("{} timed out after {:?}", operation, self.timeout),
            source,
        )
    }
}

#[async_trait]
impl<S: LedgerStore> LedgerStore for TimeoutStore<S> {
    async fn append(&self, draft: EventDraft) -> Result<Event> {
        timeout(self.timeout, self.inner.append(draft))
            .await
            .map_err(|e| self.elapsed("append", e))?
    }

    async fn iterate(&self, filter: &EventFilter) -> Result<EventStream> {
        timeout(self.timeout, self.inner.iterate(filter))
            .await
            .map_err(|e| self.elapsed("iterate", e))?
    }

    async fn count(&self, filter: &EventFilter) -> Result<usize> {
        timeout(self.timeout, self.inner.count(filter))
            .await
            .map_err(|e| self.elapsed("count", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryStore;
    use crate::domain::Namespace;
    use serde_json::json;

    /// A store whose every call hangs.
    struct StalledStore;

    #[async_trait]
    impl LedgerStore for StalledStore {
        async fn append(&self, _draft: EventDraft) -> Result<Event> {
            std::future::pending().await
        }

        async fn iterate(&self, _filter: &EventFilter) -> Result<EventStream> {
            std::future::pending().await
        }
    }

    fn draft() -> EventDraft {
        EventDraft::new("exp#1", Namespace::Observation, "observation", "t001")
            .step_key("s1")
            .payload("TwoPropObsBatch", json!({"nA": 1, "nB": 1, "mA": 0, "mB": 1}))
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_store_unavailable() {
        let store = TimeoutStore::new(StalledStore, Duration::from_millis(20));

        let err = store.append(draft()).await.unwrap_err();
        assert!(err.is_retryable());

        let err = store.count(&EventFilter::any()).await.unwrap_err();
        assert!(matches!(err, LedgerError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_timeout_passes_fast_calls_through() {
        let store = TimeoutStore::new(MemoryStore::new(), Duration::from_secs(5));
        store.append(draft()).await.unwrap();
        assert_eq!(store.count(&EventFilter::any()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stream_is_restartable() {
        let store = MemoryStore::new();
        store.append(draft()).await.unwrap();
        store.append(draft()).await.unwrap();

        let mut stream = store.iterate(&EventFilter::any()).await.unwrap();
        assert_eq!(stream.by_ref().count(), 2);
        assert_eq!(stream.next(), None);

        stream.rewind();
        assert_eq!(stream.len(), 2);
        assert!(stream.next().is_some());
    }

    #[tokio::test]
    async fn test_stream_is_a_snapshot() {
        let store = MemoryStore::new();
        store.append(draft()).await.unwrap();

        let stream = store.iterate(&EventFilter::any()).await.unwrap();
        store.append(draft()).await.unwrap();

        assert_eq!(stream.count(), 1);
        assert_eq!(store.count(&EventFilter::any()).await.unwrap(), 2);
    }
}

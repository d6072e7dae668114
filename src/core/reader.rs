//! Query façade over a store, and the shared ledger handle.

use std::fmt;
use std::sync::Arc;

use crate::domain::{Event, EventDraft, EventFilter, Namespace};
use crate::error::Result;

use super::codec::{Payload, PayloadRegistry};
use super::store::{EventStream, LedgerStore};

/// Read-only view of a ledger.
///
/// Holds no write capability; components receive one of these through their
/// step context.
#[derive(Clone)]
pub struct LedgerReader {
    store: Arc<dyn LedgerStore>,
    registry: Arc<PayloadRegistry>,
}

impl fmt::Debug for LedgerReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerReader")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl LedgerReader {
    pub fn new(store: Arc<dyn LedgerStore>, registry: Arc<PayloadRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    /// The matching event with the greatest `(time_index, sequence)`.
    ///
    /// `None` means "not yet available", never failure.
    pub async fn latest(&self, filter: &EventFilter) -> Result<Option<Event>> {
        let stream = self.store.iterate(filter).await?;
        Ok(stream.last_event().cloned())
    }

    pub async fn iterate(&self, filter: &EventFilter) -> Result<EventStream> {
        self.store.iterate(filter).await
    }

    /// All events of one namespace for one entity, in ledger order.
    pub async fn iter_namespace(
        &self,
        namespace: impl Into<Namespace>,
        entity_id: &str,
    ) -> Result<EventStream> {
        self.store
            .iterate(&EventFilter::entity(entity_id).namespace(namespace))
            .await
    }

    pub async fn count(&self, filter: &EventFilter) -> Result<usize> {
        self.store.count(filter).await
    }

    /// Decode `event` as `T`, which must be registered under the event's
    /// payload type.
    pub fn decode<T: Payload>(&self, event: &Event) -> Result<T> {
        self.registry.decode(event)
    }

    pub fn decode_as<T: 'static>(&self, event: &Event, expected: &str) -> Result<T> {
        self.registry.decode_as(event, expected)
    }

    /// [`latest`](Self::latest) followed by [`decode`](Self::decode).
    pub async fn latest_decoded<T: Payload>(&self, filter: &EventFilter) -> Result<Option<T>> {
        match self.latest(filter).await? {
            Some(event) => self.decode(&event).map(Some),
            None => Ok(None),
        }
    }
}

/// Shared handle to one ledger: a store plus the registry used to read it.
///
/// `append` is the only write operation.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    registry: Arc<PayloadRegistry>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, registry: Arc<PayloadRegistry>) -> Self {
        Self { store, registry }
    }

    /// Validate and append a raw draft. Any payload type is accepted.
    pub async fn append(&self, draft: EventDraft) -> Result<Event> {
        draft.validate()?;
        self.store.append(draft).await
    }

    /// Encode `payload` with its registered codec and append it.
    pub async fn append_typed<T: Payload>(&self, draft: EventDraft, payload: &T) -> Result<Event> {
        let value = self.registry.encode(payload)?;
        self.append(draft.payload(T::PAYLOAD_TYPE, value)).await
    }

    pub fn reader(&self) -> LedgerReader {
        LedgerReader::new(Arc::clone(&self.store), Arc::clone(&self.registry))
    }

    pub fn registry(&self) -> &Arc<PayloadRegistry> {
        &self.registry
    }
}

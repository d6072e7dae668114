//! Domain types for the earlysign ledger.
//!
//! This module contains the core data structures:
//! - Event: Immutable ledger records and the drafts they are made from
//! - Filter: Conjunctive queries over events
//! - Run: Orchestration run state, reconstructed from lifecycle events

pub mod event;
pub mod filter;
pub mod run;

// Re-export commonly used types
pub use event::{Event, EventDraft, Namespace, TimeIndex};
pub use filter::{EventFilter, TimeRange};
pub use run::{lifecycle_kind, ErrorRecord, LifecycleMarker, RunHistory, RunRecord, RunState};

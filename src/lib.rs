//! earlysign - Append-only typed event ledger for sequential decision pipelines
//!
//! Independent pipeline stages coordinate purely by reading and writing
//! immutable events in a shared ledger.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state is recorded as immutable events, never updated or deleted
//! - Each stage reads upstream namespaces and appends to its own
//! - Run state and aggregates are derived by replaying events
//!
//! # Modules
//!
//! - `domain`: Data structures (Event, EventFilter, RunRecord)
//! - `core`: Ledger engine (stores, codec registry, reader, replay)
//! - `component`: The protocol every pipeline stage implements
//! - `runtime`: Plans and the orchestrator
//! - `reference`: A two-proportion group sequential test built on the above
//! - `config` / `cli`: Application edges
//!
//! # Usage
//!
//! ```bash
//! # Run the reference pipeline on synthetic data
//! earlysign demo --entity exp-1
//!
//! # Inspect the ledger
//! earlysign list --entity exp-1 --namespace signals
//! earlysign runs exp-1
//! ```

pub mod cli;
pub mod component;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod reference;
pub mod runtime;

// Re-export main types at crate root for convenience
pub use component::{Component, Role, SignalPolicy, StepContext, StepOutcome};
pub use crate::core::{Ledger, LedgerReader, LedgerStore, MemoryStore, Payload, PayloadRegistry};
pub use domain::{Event, EventDraft, EventFilter, Namespace, TimeIndex};
pub use error::{ErrorKind, LedgerError, Result};
pub use runtime::{Orchestrator, Plan, RunReport};

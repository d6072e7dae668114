//! Core ledger engine.
//!
//! This module contains:
//! - Store: The append-only store contract and timeout wrapper
//! - Memory / Jsonl: Concrete backends
//! - Codec: Payload codec registry
//! - Reader: Query façade and the shared `Ledger` handle
//! - Replay: State reconstruction helper

pub mod codec;
pub mod jsonl;
pub mod memory;
pub mod reader;
pub mod replay;
pub mod store;

// Re-export commonly used types
pub use codec::{Codec, Payload, PayloadRegistry};
pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use reader::{Ledger, LedgerReader};
pub use replay::{replay, Projection, ReplayBound};
pub use store::{EventStream, LedgerStore, TimeoutStore};

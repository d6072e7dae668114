//! Reference statistical pipelines built on the ledger.

pub mod two_proportions;

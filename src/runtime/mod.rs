//! Runtime: plans and the orchestrator that executes them.

pub mod orchestrator;
pub mod plan;

pub use orchestrator::{register_payloads, step_key, Orchestrator, RunReport, StageReport, RUNTIME_TAG};
pub use plan::{Plan, RetryPolicy};

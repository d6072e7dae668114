//! Orchestration plans and retry policy.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::{LedgerError, Result};

/// A named, ordered list of stages executed for one logical step.
#[derive(Clone)]
pub struct Plan {
    name: String,
    stages: Vec<Arc<dyn Component>>,
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Append a stage.
    pub fn stage(mut self, component: impl Component + 'static) -> Self {
        self.stages.push(Arc::new(component));
        self
    }

    /// Append a shared stage.
    pub fn shared_stage(mut self, component: Arc<dyn Component>) -> Self {
        self.stages.push(component);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Arc<dyn Component>] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Check the plan is runnable: non-empty, unique stage names, and
    /// stages declared in dependency order.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LedgerError::InvalidPlan {
                reason: "plan name cannot be empty".to_string(),
            });
        }
        if self.stages.is_empty() {
            return Err(LedgerError::InvalidPlan {
                reason: format!("plan '{}' has no stages", self.name),
            });
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) {
                return Err(LedgerError::InvalidPlan {
                    reason: format!("duplicate stage name '{}'", stage.name()),
                });
            }
        }

        for pair in self.stages.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            if after.role().rank() < before.role().rank() {
                return Err(LedgerError::InvalidPlan {
                    reason: format!(
                        "stage '{}' ({}) cannot run after '{}' ({})",
                        after.name(),
                        after.role(),
                        before.name(),
                        before.role()
                    ),
                });
            }
        }

        Ok(())
    }
}

/// Retry policy for stages failing with a retryable error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

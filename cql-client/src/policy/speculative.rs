//! Speculative executions: redundant attempts launched before the first
//! one has answered, to hide slow nodes.
//!
//! Only idempotent requests are ever executed speculatively. Each execution
//! retries independently; the first to complete wins and the others are
//! abandoned.

use std::time::Duration;

use crate::config::SpeculativeConfig;

/// Decides whether, and when, another execution of a request starts.
pub trait SpeculativeExecutionPolicy: Send + Sync {
    /// Returns the delay before launching another execution, given how many
    /// executions already run. `None` stops launching.
    fn next_execution_delay(&self, running_executions: usize) -> Option<Duration>;
}

impl std::fmt::Debug for dyn SpeculativeExecutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SpeculativeExecutionPolicy")
    }
}

/// Never launches additional executions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSpeculativeExecution;

impl SpeculativeExecutionPolicy for NoSpeculativeExecution {
    fn next_execution_delay(&self, _running_executions: usize) -> Option<Duration> {
        None
    }
}

/// Launches up to `max_executions` executions separated by a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSpeculativeExecution {
    max_executions: usize,
    delay: Duration,
}

impl ConstantSpeculativeExecution {
    /// Creates a policy. `max_executions` counts the first execution.
    pub fn new(max_executions: usize, delay: Duration) -> Self {
        Self {
            max_executions,
            delay,
        }
    }

    /// Creates a policy from the driver configuration.
    pub fn from_config(config: &SpeculativeConfig) -> Self {
        Self::new(config.max_executions(), config.delay())
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecution {
    fn next_execution_delay(&self, running_executions: usize) -> Option<Duration> {
        (running_executions < self.max_executions).then_some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_speculative_execution() {
        assert_eq!(NoSpeculativeExecution.next_execution_delay(1), None);
    }

    #[test]
    fn test_constant_policy_stops_at_max() {
        let policy = ConstantSpeculativeExecution::new(3, Duration::from_millis(50));
        assert_eq!(policy.next_execution_delay(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.next_execution_delay(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.next_execution_delay(3), None);
    }

    #[test]
    fn test_from_config() {
        let config = crate::config::SpeculativeConfigBuilder::new()
            .max_executions(2)
            .delay(Duration::from_millis(10))
            .build()
            .unwrap();
        let policy = ConstantSpeculativeExecution::from_config(&config);
        assert_eq!(policy.next_execution_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_execution_delay(2), None);
    }
}

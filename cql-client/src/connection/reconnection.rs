//! Reconnection delay schedules.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectionConfig;

/// Produces the delays between reconnection attempts to one node.
pub trait ReconnectionPolicy: Send + Sync + std::fmt::Debug {
    /// Starts a new schedule. Each outage of each node gets its own.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// A stateful sequence of delays.
pub trait ReconnectionSchedule: Send + std::fmt::Debug {
    /// Returns the delay before the next attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Calculates the next backoff duration with jitter applied.
fn calculate_backoff_with_jitter(
    current: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
) -> Duration {
    let base = current.as_secs_f64() * multiplier;

    let jitter_factor = if jitter > 0.0 {
        let mut rng = rand::thread_rng();
        1.0 + rng.gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    let next = (base * jitter_factor).min(max.as_secs_f64());
    Duration::try_from_secs_f64(next).map_or(max, |delay| delay.min(max))
}

/// Exponentially growing delays with jitter, capped at a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialReconnectionPolicy {
    /// Creates a policy from explicit settings.
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Creates a policy from the driver configuration.
    pub fn from_config(config: &ReconnectionConfig) -> Self {
        Self::new(
            config.base_delay(),
            config.max_delay(),
            config.multiplier(),
            config.jitter(),
        )
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectionConfig::default())
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            policy: self.clone(),
            current: None,
        })
    }
}

#[derive(Debug)]
struct ExponentialSchedule {
    policy: ExponentialReconnectionPolicy,
    current: Option<Duration>,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.policy.base_delay,
            Some(current) => calculate_backoff_with_jitter(
                current,
                self.policy.multiplier,
                self.policy.max_delay,
                self.policy.jitter,
            ),
        };
        self.current = Some(delay.max(self.policy.base_delay));
        delay
    }
}

/// The same delay before every attempt.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    /// Creates a policy waiting `delay` between attempts.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule(self.delay))
    }
}

#[derive(Debug)]
struct ConstantSchedule(Duration);

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.0
    }
}

//! The per-request execution state machine.
//!
//! [`Execution`] is a pure function from events to effects: it never
//! touches a socket or a timer. The async handler feeds it events and
//! carries out the effects, which keeps every ordering and retry rule
//! testable without I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cql_core::{DriverError, NodeErrors};

use crate::metadata::Node;
use crate::policy::{
    QueryPlan, RetryContext, RetryDecision, RetryPolicy, SpeculativeExecutionPolicy,
};

/// Identifies one attempt of a request on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u32);

impl AttemptId {
    /// Returns the raw value; attempts are numbered from zero in send order.
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing was sent yet.
    NotStarted,
    /// At least one attempt is outstanding or about to be sent.
    InFlight,
    /// The caller got a response.
    Resolved,
    /// The caller got an error.
    Failed,
    /// The caller cancelled; nothing is reported.
    Cancelled,
}

impl Phase {
    /// Returns true once no further event can change the outcome.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Cancelled)
    }
}

/// Something that happened to a request.
#[derive(Debug, Clone)]
pub enum Event {
    /// The caller submitted the request.
    Start,
    /// An attempt returned a non-error response.
    Succeeded {
        /// The attempt that answered.
        attempt: AttemptId,
    },
    /// An attempt failed, including per-attempt timeouts.
    Failed {
        /// The attempt that failed.
        attempt: AttemptId,
        /// Why it failed.
        error: DriverError,
    },
    /// The speculative execution delay elapsed.
    SpeculativeTimer,
    /// The overall deadline of the request elapsed.
    DeadlineExpired {
        /// Time since the request started.
        elapsed: Duration,
    },
    /// The caller cancelled the request.
    Cancelled,
}

/// Something the handler must do.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a new attempt to a node.
    Send {
        /// Id of the new attempt.
        attempt: AttemptId,
        /// Target node.
        node: Arc<Node>,
    },
    /// Fire [`Event::SpeculativeTimer`] after the delay, replacing any
    /// pending timer.
    ScheduleSpeculative(Duration),
    /// Complete the request with the response of this attempt.
    Resolve {
        /// The winning attempt.
        attempt: AttemptId,
    },
    /// Complete the request with an empty result.
    ResolveIgnored,
    /// Complete the request with an error.
    Fail(DriverError),
}

#[derive(Debug)]
struct Attempt {
    node: Arc<Node>,
    line: usize,
}

/// One execution line: the first execution or a speculative one. Each line
/// counts its own retries.
#[derive(Debug, Default)]
struct Line {
    retry_count: u32,
}

/// State of one request across all its attempts.
pub struct Execution {
    phase: Phase,
    plan: QueryPlan,
    idempotent: bool,
    speculative_allowed: bool,
    retry: Arc<dyn RetryPolicy>,
    speculative: Arc<dyn SpeculativeExecutionPolicy>,
    in_flight: HashMap<AttemptId, Attempt>,
    lines: Vec<Line>,
    errors: NodeErrors,
    next_attempt: u32,
    winner: Option<Arc<Node>>,
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("phase", &self.phase)
            .field("remaining_plan", &self.plan.remaining())
            .field("in_flight", &self.in_flight.len())
            .field("executions", &self.lines.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl Execution {
    /// Creates the state of a request that has not started yet.
    ///
    /// Speculative executions are only launched for idempotent requests.
    pub fn new(
        plan: QueryPlan,
        idempotent: bool,
        speculative_enabled: bool,
        retry: Arc<dyn RetryPolicy>,
        speculative: Arc<dyn SpeculativeExecutionPolicy>,
    ) -> Self {
        Self {
            phase: Phase::NotStarted,
            plan,
            idempotent,
            speculative_allowed: speculative_enabled && idempotent,
            retry,
            speculative,
            in_flight: HashMap::new(),
            lines: Vec::new(),
            errors: NodeErrors::new(),
            next_attempt: 0,
            winner: None,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns every failure recorded so far, in order.
    pub fn errors(&self) -> &NodeErrors {
        &self.errors
    }

    /// Returns the number of outstanding attempts.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the number of attempts sent so far.
    pub fn attempts(&self) -> u32 {
        self.next_attempt
    }

    /// Returns the number of speculative executions launched.
    pub fn speculative_executions(&self) -> usize {
        self.lines.len().saturating_sub(1)
    }

    /// Returns the node of an outstanding attempt.
    pub fn node_of(&self, attempt: AttemptId) -> Option<&Arc<Node>> {
        self.in_flight.get(&attempt).map(|a| &a.node)
    }

    /// Returns the node whose answer completed the request.
    pub fn coordinator(&self) -> Option<&Arc<Node>> {
        self.winner.as_ref()
    }

    /// Applies an event and returns the effects to carry out.
    ///
    /// Events arriving after the request completed are ignored, so late
    /// responses and races between executions resolve at most once.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        match event {
            Event::Start => self.on_start(),
            Event::Succeeded { attempt } => self.on_success(attempt),
            Event::Failed { attempt, error } => self.on_failure(attempt, error),
            Event::SpeculativeTimer => self.on_speculative_timer(),
            Event::DeadlineExpired { elapsed } => {
                if self.phase != Phase::InFlight {
                    return Vec::new();
                }
                self.phase = Phase::Failed;
                self.in_flight.clear();
                vec![Effect::Fail(DriverError::RequestTimeout {
                    elapsed,
                    attempts: self.errors.clone(),
                })]
            }
            Event::Cancelled => {
                self.phase = Phase::Cancelled;
                self.in_flight.clear();
                Vec::new()
            }
        }
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.phase != Phase::NotStarted {
            return Vec::new();
        }
        self.phase = Phase::InFlight;
        self.lines.push(Line::default());

        let mut effects = Vec::with_capacity(2);
        match self.send_next(0) {
            Some(send) => effects.push(send),
            None => return self.fail_exhausted(),
        }
        self.schedule_speculative(&mut effects);
        effects
    }

    fn on_success(&mut self, attempt: AttemptId) -> Vec<Effect> {
        let Some(state) = self.in_flight.remove(&attempt) else {
            return Vec::new();
        };
        self.phase = Phase::Resolved;
        self.winner = Some(state.node);
        self.in_flight.clear();
        vec![Effect::Resolve { attempt }]
    }

    fn on_failure(&mut self, attempt: AttemptId, error: DriverError) -> Vec<Effect> {
        let Some(state) = self.in_flight.remove(&attempt) else {
            return Vec::new();
        };
        self.errors.push(state.node.address(), error.clone());

        let decision = if error.is_connection_level() {
            RetryDecision::RetryNextNode
        } else {
            let context = RetryContext {
                error: &error,
                idempotent: self.idempotent,
                retry_count: self.lines[state.line].retry_count,
            };
            match error {
                DriverError::RequestTimeout { .. } => self.retry.on_request_timeout(&context),
                _ => self.retry.on_error(&context),
            }
        };
        tracing::debug!(
            attempt = attempt.value(),
            node = %state.node,
            error = %error,
            decision = ?decision,
            "attempt failed"
        );

        match decision {
            RetryDecision::RetrySameNode => {
                self.lines[state.line].retry_count += 1;
                vec![self.send_to(state.node, state.line)]
            }
            RetryDecision::RetryNextNode => {
                if !error.is_connection_level() {
                    self.lines[state.line].retry_count += 1;
                }
                match self.send_next(state.line) {
                    Some(send) => vec![send],
                    None if self.in_flight.is_empty() => self.fail_exhausted(),
                    None => Vec::new(),
                }
            }
            RetryDecision::Rethrow => {
                self.phase = Phase::Failed;
                self.in_flight.clear();
                vec![Effect::Fail(error.with_attempts(self.errors.clone()))]
            }
            RetryDecision::Ignore => {
                self.phase = Phase::Resolved;
                self.winner = Some(state.node);
                self.in_flight.clear();
                vec![Effect::ResolveIgnored]
            }
        }
    }

    fn on_speculative_timer(&mut self) -> Vec<Effect> {
        if self.phase != Phase::InFlight || !self.speculative_allowed {
            return Vec::new();
        }
        let line = self.lines.len();
        let Some(node) = self.plan.next() else {
            tracing::trace!("no node left for a speculative execution");
            return Vec::new();
        };
        self.lines.push(Line::default());
        tracing::debug!(execution = line, node = %node, "starting speculative execution");

        let mut effects = vec![self.send_to(node, line)];
        self.schedule_speculative(&mut effects);
        effects
    }

    fn schedule_speculative(&self, effects: &mut Vec<Effect>) {
        if !self.speculative_allowed || self.plan.is_exhausted() {
            return;
        }
        if let Some(delay) = self.speculative.next_execution_delay(self.lines.len()) {
            effects.push(Effect::ScheduleSpeculative(delay));
        }
    }

    fn send_next(&mut self, line: usize) -> Option<Effect> {
        let node = self.plan.next()?;
        Some(self.send_to(node, line))
    }

    fn send_to(&mut self, node: Arc<Node>, line: usize) -> Effect {
        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.in_flight.insert(
            attempt,
            Attempt {
                node: Arc::clone(&node),
                line,
            },
        );
        Effect::Send { attempt, node }
    }

    fn fail_exhausted(&mut self) -> Vec<Effect> {
        self.phase = Phase::Failed;
        vec![Effect::Fail(DriverError::NoNodeAvailable(self.errors.clone()))]
    }
}

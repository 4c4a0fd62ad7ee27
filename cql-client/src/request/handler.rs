//! Drives an [`Execution`] against live channels.

use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cql_core::protocol::{response, Frame, Opcode};
use cql_core::{DriverError, NodeErrors, Result};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::state::{AttemptId, Effect, Event, Execution, Phase};
use super::{ExecutionInfo, Request, Response};
use crate::config::ExecutionProfile;
use crate::connection::{ChannelPool, DriverChannel};
use crate::metadata::{Node, NodeId};
use crate::policy::{QueryPlan, RetryPolicy, SpeculativeExecutionPolicy};

/// Pools of the session, keyed by node.
pub(crate) type PoolMap = Arc<RwLock<HashMap<NodeId, Arc<ChannelPool>>>>;

type AttemptFuture = BoxFuture<'static, (AttemptId, Result<Frame>)>;

/// Executes requests using the session's pools and policies.
#[derive(Debug, Clone)]
pub(crate) struct RequestHandler {
    pools: PoolMap,
    retry: Arc<dyn RetryPolicy>,
    speculative: Arc<dyn SpeculativeExecutionPolicy>,
}

impl RequestHandler {
    pub(crate) fn new(
        pools: PoolMap,
        retry: Arc<dyn RetryPolicy>,
        speculative: Arc<dyn SpeculativeExecutionPolicy>,
    ) -> Self {
        Self {
            pools,
            retry,
            speculative,
        }
    }

    /// Runs a request to completion over the given plan.
    ///
    /// Every attempt is bounded by the profile's request timeout and the
    /// whole request by its deadline. Returns [`DriverError::Cancelled`]
    /// once `cancel` fires; outstanding attempts are dropped, which orphans
    /// their stream ids until the late responses arrive.
    #[instrument(
        name = "request.execute",
        skip(self, request, profile, plan, cancel),
        fields(opcode = ?request.opcode(), profile = profile.name(), plan = plan.len())
    )]
    pub(crate) async fn execute(
        &self,
        request: &Request,
        profile: &ExecutionProfile,
        plan: QueryPlan,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let started = Instant::now();
        let idempotent = request.idempotent().unwrap_or_else(|| profile.idempotent());
        let mut execution = Execution::new(
            plan,
            idempotent,
            profile.speculative_execution(),
            Arc::clone(&self.retry),
            Arc::clone(&self.speculative),
        );

        let mut attempts: FuturesUnordered<AttemptFuture> = FuturesUnordered::new();
        let mut pending_events: VecDeque<Event> = VecDeque::new();
        let mut answers: HashMap<AttemptId, (SocketAddr, Frame)> = HashMap::new();
        let mut speculative_timer: Option<Pin<Box<Sleep>>> = None;
        let mut deadline = profile.deadline().map(|d| Box::pin(sleep(d)));

        let mut effects = execution.handle(Event::Start);
        loop {
            for effect in effects.drain(..) {
                match effect {
                    Effect::Send { attempt, node } => {
                        match self.send(request, &node, profile.request_timeout(), attempt) {
                            Ok(future) => attempts.push(future),
                            Err(error) => pending_events.push_back(Event::Failed { attempt, error }),
                        }
                    }
                    Effect::ScheduleSpeculative(delay) => {
                        speculative_timer = Some(Box::pin(sleep(delay)));
                    }
                    Effect::Resolve { attempt } => {
                        let (address, frame) = answers.remove(&attempt).ok_or_else(|| {
                            DriverError::Protocol("resolved attempt has no response".to_string())
                        })?;
                        let info = execution_info(&execution, Some(address));
                        tracing::debug!(
                            coordinator = %address,
                            attempts = info.attempts,
                            elapsed = ?started.elapsed(),
                            "request completed"
                        );
                        return Response::from_frame(frame, info);
                    }
                    Effect::ResolveIgnored => {
                        let coordinator = execution.coordinator().map(|n| n.address());
                        return Ok(Response::ignored(execution_info(&execution, coordinator)));
                    }
                    Effect::Fail(error) => {
                        tracing::debug!(error = %error, elapsed = ?started.elapsed(), "request failed");
                        return Err(error);
                    }
                }
            }
            if execution.phase() == Phase::Cancelled {
                return Err(DriverError::Cancelled);
            }

            let event = match pending_events.pop_front() {
                Some(event) => event,
                None => {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => Event::Cancelled,
                        _ = wait(&mut deadline) => Event::DeadlineExpired {
                            elapsed: started.elapsed(),
                        },
                        Some((attempt, result)) = attempts.next(), if !attempts.is_empty() => {
                            classify(&execution, &mut answers, attempt, result)
                        }
                        _ = wait(&mut speculative_timer) => {
                            speculative_timer = None;
                            Event::SpeculativeTimer
                        }
                    }
                }
            };
            effects = execution.handle(event);
        }
    }

    fn send(
        &self,
        request: &Request,
        node: &Arc<Node>,
        timeout: Duration,
        attempt: AttemptId,
    ) -> Result<AttemptFuture> {
        let pool = self
            .pools
            .read()
            .get(&node.id())
            .cloned()
            .ok_or(DriverError::NodeUnavailable(node.address()))?;
        let channel = pool.pick_channel()?;
        let response = channel.send(request.opcode(), request.body().clone())?;
        tracing::trace!(
            attempt = attempt.value(),
            node = %node,
            channel = %channel.id(),
            stream = response.stream_id(),
            "attempt sent"
        );

        let address = node.address();
        Ok(async move {
            let sent = Instant::now();
            let result = match tokio::time::timeout(timeout, response).await {
                Ok(result) => {
                    result.and_then(|frame| check_error_frame(frame, address, &channel))
                }
                Err(_) => Err(DriverError::RequestTimeout {
                    elapsed: sent.elapsed(),
                    attempts: NodeErrors::new(),
                }),
            };
            (attempt, result)
        }
        .boxed())
    }
}

/// Decodes an ERROR answer into a server error. An ERROR body that cannot be
/// decoded leaves the channel in an unknown state, so the channel is closed.
fn check_error_frame(frame: Frame, address: SocketAddr, channel: &DriverChannel) -> Result<Frame> {
    if frame.opcode != Opcode::Error {
        return Ok(frame);
    }
    match response::parse_error(frame.body) {
        Ok(error) => Err(DriverError::Server {
            address,
            error,
            attempts: NodeErrors::new(),
        }),
        Err(error) => {
            tracing::warn!(
                channel = %channel.id(),
                %address,
                error = %error,
                "malformed error response"
            );
            channel.close("malformed error response");
            Err(error)
        }
    }
}

/// Turns the outcome of an attempt into an event, keeping successful frames
/// until the execution decides which one wins.
fn classify(
    execution: &Execution,
    answers: &mut HashMap<AttemptId, (SocketAddr, Frame)>,
    attempt: AttemptId,
    result: Result<Frame>,
) -> Event {
    let Some(address) = execution.node_of(attempt).map(|n| n.address()) else {
        return Event::Failed {
            attempt,
            error: DriverError::Cancelled,
        };
    };
    match result {
        Ok(frame) => {
            answers.insert(attempt, (address, frame));
            Event::Succeeded { attempt }
        }
        Err(error) => Event::Failed { attempt, error },
    }
}

fn execution_info(execution: &Execution, coordinator: Option<SocketAddr>) -> ExecutionInfo {
    ExecutionInfo {
        coordinator,
        speculative_executions: execution.speculative_executions(),
        attempts: execution.attempts(),
        errors: execution.errors().clone(),
        ..ExecutionInfo::default()
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

//! Pluggable policies: load balancing, retries and speculative executions.

mod load_balancing;
mod local_dc;
mod retry;
mod speculative;

pub use load_balancing::{DefaultLoadBalancingPolicy, LoadBalancingPolicy, QueryPlan};
pub use local_dc::discover_local_datacenter;
pub use retry::{
    DefaultRetryPolicy, FallthroughRetryPolicy, RetryContext, RetryDecision, RetryPolicy,
};
pub use speculative::{
    ConstantSpeculativeExecution, NoSpeculativeExecution, SpeculativeExecutionPolicy,
};

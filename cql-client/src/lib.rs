//! Async execution core for a CQL cluster driver, built on [Tokio](https://tokio.rs/).
//!
//! The crate multiplexes requests over a few persistent channels per node,
//! routes each request with a token-aware, datacenter-aware query plan and
//! survives node failures through retries, speculative executions and
//! background reconnection.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cql_client::{Consistency, DriverConfig, Request, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DriverConfig::builder()
//!         .add_contact_point("127.0.0.1:9042".parse()?)
//!         .local_datacenter("datacenter1")
//!         .build()?;
//!     let session = Session::connect(config).await?;
//!
//!     let request = Request::query("SELECT now() FROM system.local", Consistency::One)
//!         .with_idempotent(true);
//!     let response = session.execute(&request).await?;
//!     println!("coordinator: {:?}", response.info().coordinator);
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`connection`] | One TCP channel per [`DriverChannel`], stream-id multiplexing, per-node [`ChannelPool`] |
//! | [`metadata`] | [`NodeRegistry`] holding node state and distance, token ring |
//! | [`policy`] | Load balancing, retry and speculative execution decisions |
//! | [`request`] | The per-request execution state machine |
//! | [`Session`] | Wires everything together and keeps the registry in sync |
//!
//! # Configuration
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cql_client::DriverConfig;
//!
//! let config = DriverConfig::builder()
//!     .add_contact_point("10.0.0.1:9042".parse().unwrap())
//!     .local_datacenter("dc1")
//!     .pool(|p| p.local_size(4).max_requests_per_channel(2048))
//!     .request(|r| r.request_timeout(Duration::from_secs(1)).idempotent(true))
//!     .profile("analytics", |p| p.request_timeout(Duration::from_secs(30)))
//!     .build()
//!     .expect("invalid config");
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod config_file;
pub mod connection;
pub mod metadata;
pub mod policy;
pub mod request;
mod session;

pub use config::{
    ConfigError, Credentials, DriverConfig, DriverConfigBuilder, ExecutionProfile,
    ExecutionProfileBuilder, NetworkConfig, NetworkConfigBuilder, PoolConfig, PoolConfigBuilder,
    ProtocolVersion, ReconnectionConfig, ReconnectionConfigBuilder, SpeculativeConfig,
    SpeculativeConfigBuilder,
};
pub use connection::{
    Authenticator, ChannelConfig, ChannelPool, ConstantReconnectionPolicy, DriverChannel,
    ExponentialReconnectionPolicy, PlainTextAuthenticator, ReconnectionPolicy,
};
pub use cql_core as core;
pub use cql_core::{DriverError, NodeErrors, Result};
pub use metadata::{
    ClusterSnapshot, Distance, Node, NodeEvent, NodeId, NodeInfo, NodeRegistry, NodeState,
    StaticTopologyMonitor, TopologyMonitor,
};
pub use policy::{
    ConstantSpeculativeExecution, DefaultLoadBalancingPolicy, DefaultRetryPolicy,
    FallthroughRetryPolicy, LoadBalancingPolicy, NoSpeculativeExecution, QueryPlan, RetryDecision,
    RetryPolicy, SpeculativeExecutionPolicy,
};
pub use request::{Consistency, ExecutionInfo, Request, Response};
pub use session::{ExecutionHandle, Session, SessionBuilder, SessionEvent};

//! Channels to cluster nodes and their pooling.

mod auth;
mod channel;
mod pool;
mod reconnection;
mod stream_ids;

pub use auth::{Authenticator, PlainTextAuthenticator};
pub use channel::{ChannelConfig, ChannelId, DriverChannel, ResponseFuture};
pub use pool::ChannelPool;
pub use reconnection::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
    ReconnectionSchedule,
};

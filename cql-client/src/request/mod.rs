//! Requests, responses and the coordinator that executes them across the
//! cluster.

mod handler;
mod state;

use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use cql_core::protocol::{body, Frame, Opcode, FLAG_CUSTOM_PAYLOAD};
use cql_core::{DriverError, Murmur3Partitioner, NodeErrors, Result, Token};
use uuid::Uuid;

pub(crate) use handler::{PoolMap, RequestHandler};
pub use state::{AttemptId, Effect, Event, Execution, Phase};

/// Consistency level of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Consistency {
    /// Any node, including hinted handoff.
    Any,
    /// One replica.
    One,
    /// Two replicas.
    Two,
    /// Three replicas.
    Three,
    /// A quorum of all replicas.
    Quorum,
    /// Every replica.
    All,
    /// A quorum of the replicas in the local datacenter.
    #[default]
    LocalQuorum,
    /// A quorum in every datacenter.
    EachQuorum,
    /// Serial reads of lightweight transactions.
    Serial,
    /// Serial reads restricted to the local datacenter.
    LocalSerial,
    /// One replica in the local datacenter.
    LocalOne,
}

impl Consistency {
    /// Returns the wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Any => 0x00,
            Self::One => 0x01,
            Self::Two => 0x02,
            Self::Three => 0x03,
            Self::Quorum => 0x04,
            Self::All => 0x05,
            Self::LocalQuorum => 0x06,
            Self::EachQuorum => 0x07,
            Self::Serial => 0x08,
            Self::LocalSerial => 0x09,
            Self::LocalOne => 0x0A,
        }
    }
}

/// A request ready to be sent: an opcode, an encoded body and routing hints.
#[derive(Debug, Clone)]
pub struct Request {
    opcode: Opcode,
    body: Bytes,
    idempotent: Option<bool>,
    routing_key: Option<Bytes>,
    routing_token: Option<Token>,
    profile: Option<String>,
}

impl Request {
    /// Creates a request from an opcode and an already encoded body.
    pub fn new(opcode: Opcode, body: Bytes) -> Self {
        Self {
            opcode,
            body,
            idempotent: None,
            routing_key: None,
            routing_token: None,
            profile: None,
        }
    }

    /// Creates a QUERY request without bound values.
    pub fn query(cql: &str, consistency: Consistency) -> Self {
        Self::new(Opcode::Query, body::query_body(cql, consistency.as_u16()))
    }

    /// Overrides the idempotence of the execution profile.
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Sets the serialized partition key used to route the request.
    pub fn with_routing_key(mut self, key: impl Into<Bytes>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Sets the token used to route the request. Takes precedence over the
    /// routing key.
    pub fn with_routing_token(mut self, token: Token) -> Self {
        self.routing_token = Some(token);
        self
    }

    /// Runs the request with a named execution profile.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Returns the opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Returns the encoded body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the idempotence override, if any.
    pub fn idempotent(&self) -> Option<bool> {
        self.idempotent
    }

    /// Returns the execution profile name, if any.
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Returns the token the request routes to, if it carries routing
    /// information.
    pub fn token(&self) -> Option<Token> {
        self.routing_token.or_else(|| {
            self.routing_key
                .as_ref()
                .map(|key| Murmur3Partitioner.token(key))
        })
    }
}

/// What happened while executing a request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInfo {
    /// Node whose answer completed the request.
    pub coordinator: Option<SocketAddr>,
    /// Number of speculative executions launched.
    pub speculative_executions: usize,
    /// Attempts sent in total.
    pub attempts: u32,
    /// Failures of the attempts that did not win.
    pub errors: NodeErrors,
    /// Warnings attached to the response.
    pub warnings: Vec<String>,
    /// Tracing session id, when tracing was requested.
    pub tracing_id: Option<Uuid>,
}

/// The successful outcome of a request.
#[derive(Debug, Clone)]
pub struct Response {
    frame: Option<Frame>,
    body: Bytes,
    info: ExecutionInfo,
}

impl Response {
    /// Builds a response from the frame that answered, stripping the
    /// optional tracing id, warnings and custom payload from the body.
    pub(crate) fn from_frame(frame: Frame, mut info: ExecutionInfo) -> Result<Self> {
        let mut body = frame.body.clone();
        if frame.has_tracing() {
            if body.remaining() < 16 {
                return Err(DriverError::Protocol("truncated tracing id".to_string()));
            }
            let id = body.split_to(16);
            info.tracing_id = Uuid::from_slice(&id).ok();
        }
        if frame.has_warnings() {
            info.warnings = body::read_string_list(&mut body)?;
        }
        if frame.flags & FLAG_CUSTOM_PAYLOAD != 0 {
            let entries = body::read_short(&mut body)?;
            for _ in 0..entries {
                body::read_string(&mut body)?;
                body::read_bytes(&mut body)?;
            }
        }
        Ok(Self {
            frame: Some(frame),
            body,
            info,
        })
    }

    /// A response for a failure the retry policy chose to ignore.
    pub(crate) fn ignored(info: ExecutionInfo) -> Self {
        Self {
            frame: None,
            body: Bytes::new(),
            info,
        }
    }

    /// Returns true if the request failed and the failure was ignored.
    pub fn is_ignored(&self) -> bool {
        self.frame.is_none()
    }

    /// Returns the response opcode, `None` for ignored failures.
    pub fn opcode(&self) -> Option<Opcode> {
        self.frame.as_ref().map(|f| f.opcode)
    }

    /// Returns the body after the optional response prefixes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the raw frame.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Returns the execution details.
    pub fn info(&self) -> &ExecutionInfo {
        &self.info
    }
}

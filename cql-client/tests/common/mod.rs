//! Common test utilities for integration tests.
//!
//! [`MockNode`] is a minimal CQL node listening on an ephemeral port. It
//! answers the handshake, heartbeats and REGISTER, and replies to queries
//! according to a configurable [`QueryReply`].

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use cql_client::core::protocol::{body, response, Frame, FrameCodec, Opcode, ServerEvent};
use cql_client::core::{ErrorCode, ErrorDetails, ServerError};
use cql_client::{DriverConfig, DriverConfigBuilder, ProtocolVersion};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const LOCAL_DC: &str = "dc1";

const RESULT_KIND_VOID: i32 = 0x0001;
const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// How a mock node answers QUERY, PREPARE, EXECUTE and BATCH.
#[derive(Debug, Clone)]
pub enum QueryReply {
    /// A void RESULT.
    Void,
    /// An ERROR frame.
    Error(ServerError),
    /// An ERROR frame whose body is truncated.
    MalformedError,
    /// A void RESULT after a delay.
    Delay(Duration),
    /// No answer at all.
    Silent,
    /// Drops the connection.
    Close,
}

/// Handshake behavior of a mock node.
#[derive(Debug, Clone)]
pub struct MockSettings {
    pub max_version: u8,
    pub credentials: Option<(String, String)>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            max_version: ProtocolVersion::V4.value(),
            credentials: None,
        }
    }
}

struct MockState {
    settings: MockSettings,
    reply: Mutex<QueryReply>,
    answer_heartbeats: AtomicBool,
    connections: AtomicUsize,
    open_connections: AtomicUsize,
    startups: AtomicUsize,
    queries: AtomicUsize,
    heartbeats: AtomicUsize,
    registrations: AtomicUsize,
    events: broadcast::Sender<ServerEvent>,
}

/// A fake node bound to `127.0.0.1` on an ephemeral port.
pub struct MockNode {
    address: SocketAddr,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockNode {
    pub async fn start() -> Self {
        Self::start_with(MockSettings::default()).await
    }

    pub async fn start_with(settings: MockSettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            settings,
            reply: Mutex::new(QueryReply::Void),
            answer_heartbeats: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            open_connections: AtomicUsize::new(0),
            startups: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
            events,
        });
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => return,
                    },
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    socket,
                    Arc::clone(&accept_state),
                    accept_shutdown.child_token(),
                ));
            }
        });

        Self {
            address,
            state,
            shutdown,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn set_reply(&self, reply: QueryReply) {
        *self.state.reply.lock() = reply;
    }

    pub fn set_answer_heartbeats(&self, answer: bool) {
        self.state.answer_heartbeats.store(answer, Ordering::SeqCst);
    }

    /// Sends a push event on every connection that registered for events.
    pub fn push_event(&self, event: ServerEvent) -> usize {
        self.state.events.send(event).unwrap_or(0)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    pub fn startups(&self) -> usize {
        self.state.startups.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    /// Stops accepting connections and drops every open one.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(socket: TcpStream, state: Arc<MockState>, shutdown: CancellationToken) {
    state.open_connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut frames) = Framed::new(socket, FrameCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut events: Option<broadcast::Receiver<ServerEvent>> = None;
    let mut version = ProtocolVersion::V4.value();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = next_event(&mut events) => {
                let push = Frame::response(version, -1, Opcode::Event, event.to_body());
                let _ = tx.send(push);
                continue;
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => frame,
                _ => break,
            },
        };
        version = frame.version;
        let reply = |opcode, content| Frame::response(frame.version, frame.stream, opcode, content);

        match frame.opcode {
            Opcode::Startup => {
                state.startups.fetch_add(1, Ordering::SeqCst);
                if frame.version > state.settings.max_version {
                    let error = ServerError::new(
                        ErrorCode::ProtocolError,
                        format!("Invalid or unsupported protocol version ({})", frame.version),
                    );
                    let answer = Frame::response(
                        state.settings.max_version,
                        frame.stream,
                        Opcode::Error,
                        response::error_body(&error),
                    );
                    let _ = tx.send(answer);
                } else if state.settings.credentials.is_some() {
                    let mut buf = BytesMut::new();
                    body::write_string(&mut buf, PASSWORD_AUTHENTICATOR);
                    let _ = tx.send(reply(Opcode::Authenticate, buf.freeze()));
                } else {
                    let _ = tx.send(reply(Opcode::Ready, Bytes::new()));
                }
            }
            Opcode::AuthResponse => {
                let mut payload = frame.body.clone();
                let token = body::read_bytes(&mut payload).ok().flatten();
                let expected = state.settings.credentials.as_ref().map(|(user, pass)| {
                    let mut token = vec![0u8];
                    token.extend_from_slice(user.as_bytes());
                    token.push(0);
                    token.extend_from_slice(pass.as_bytes());
                    token
                });
                if token.as_deref() == expected.as_deref() {
                    let mut buf = BytesMut::new();
                    body::write_bytes(&mut buf, None);
                    let _ = tx.send(reply(Opcode::AuthSuccess, buf.freeze()));
                } else {
                    let error = ServerError::new(ErrorCode::BadCredentials, "bad username or password");
                    let _ = tx.send(reply(Opcode::Error, response::error_body(&error)));
                }
            }
            Opcode::Options => {
                state.heartbeats.fetch_add(1, Ordering::SeqCst);
                if state.answer_heartbeats.load(Ordering::SeqCst) {
                    let mut buf = BytesMut::new();
                    buf.put_u16(0);
                    let _ = tx.send(reply(Opcode::Supported, buf.freeze()));
                }
            }
            Opcode::Register => {
                state.registrations.fetch_add(1, Ordering::SeqCst);
                events = Some(state.events.subscribe());
                let _ = tx.send(reply(Opcode::Ready, Bytes::new()));
            }
            Opcode::Query | Opcode::Prepare | Opcode::Execute | Opcode::Batch => {
                state.queries.fetch_add(1, Ordering::SeqCst);
                let behavior = state.reply.lock().clone();
                match behavior {
                    QueryReply::Void => {
                        let _ = tx.send(reply(Opcode::Result, void_result()));
                    }
                    QueryReply::Error(error) => {
                        let _ = tx.send(reply(Opcode::Error, response::error_body(&error)));
                    }
                    QueryReply::MalformedError => {
                        let _ = tx.send(reply(Opcode::Error, Bytes::from_static(&[0, 0])));
                    }
                    QueryReply::Delay(delay) => {
                        let answer = reply(Opcode::Result, void_result());
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(answer);
                        });
                    }
                    QueryReply::Silent => {}
                    QueryReply::Close => break,
                }
            }
            _ => {
                let error = ServerError::new(ErrorCode::ProtocolError, "unexpected opcode");
                let _ = tx.send(reply(Opcode::Error, response::error_body(&error)));
            }
        }
    }

    writer.abort();
    state.open_connections.fetch_sub(1, Ordering::SeqCst);
}

async fn next_event(events: &mut Option<broadcast::Receiver<ServerEvent>>) -> ServerEvent {
    loop {
        match events {
            Some(rx) => match rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => *events = None,
            },
            None => futures::future::pending::<()>().await,
        }
    }
}

fn void_result() -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(RESULT_KIND_VOID);
    buf.freeze()
}

pub fn unavailable() -> ServerError {
    ServerError::new(ErrorCode::Unavailable, "Cannot achieve consistency level QUORUM")
        .with_details(ErrorDetails::Unavailable {
            consistency: 0x0004,
            required: 2,
            alive: 1,
        })
}

pub fn syntax_error() -> ServerError {
    ServerError::new(ErrorCode::SyntaxError, "line 1:0 no viable alternative at input")
}

/// Returns an address nothing listens on.
pub async fn unused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address
}

/// A configuration pointing at the given nodes with short timeouts.
pub fn config_builder(nodes: &[&MockNode]) -> DriverConfigBuilder {
    let mut builder = DriverConfig::builder()
        .local_datacenter(LOCAL_DC)
        .network(|n| {
            n.connect_timeout(Duration::from_millis(500))
                .heartbeat_interval(Duration::from_secs(30))
        })
        .reconnection(|r| {
            r.base_delay(Duration::from_millis(50))
                .max_delay(Duration::from_millis(200))
                .jitter(0.0)
        })
        .request(|r| r.request_timeout(Duration::from_millis(500)));
    for node in nodes {
        builder = builder.add_contact_point(node.address());
    }
    builder
}

pub fn config(nodes: &[&MockNode]) -> DriverConfig {
    config_builder(nodes).build().expect("failed to build config")
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

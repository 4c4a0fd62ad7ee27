//! A single multiplexed connection to one node.
//!
//! A [`DriverChannel`] owns one TCP socket. Requests are tagged with a
//! stream id, written by a dedicated writer task and matched to their
//! responses by a reader task. Server push events arrive on stream `-1` and
//! are forwarded to the session.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use cql_core::protocol::{
    body, response, Frame, FrameCodec, Opcode, ServerEvent, EVENT_SCHEMA_CHANGE,
    EVENT_STATUS_CHANGE, EVENT_TOPOLOGY_CHANGE,
};
use cql_core::{ConnectionError, DriverError, ErrorCode, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::auth::Authenticator;
use super::stream_ids::StreamIdSet;
use crate::config::{DriverConfig, ProtocolVersion};

/// Stream id used by handshake exchanges, before multiplexing starts.
const HANDSHAKE_STREAM_ID: i16 = 0;

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Unique identifier for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Generates a new unique channel id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Settings used to open one channel.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Protocol version to request.
    pub version: ProtocolVersion,
    /// Limit on connect plus handshake.
    pub connect_timeout: Duration,
    /// Time without any inbound frame after which a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Time a heartbeat may wait for its answer.
    pub heartbeat_timeout: Duration,
    /// Whether TCP_NODELAY is set.
    pub tcp_nodelay: bool,
    /// Number of usable stream ids.
    pub max_requests: usize,
    /// Orphaned stream ids tolerated before the channel closes itself.
    pub max_orphans: usize,
    /// Authenticator used when the server asks for credentials.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Whether to subscribe to push events during the handshake.
    pub register_events: bool,
    /// Where push events are forwarded.
    pub events: Option<broadcast::Sender<ServerEvent>>,
}

impl ChannelConfig {
    /// Derives channel settings from the driver configuration.
    pub fn from_config(config: &DriverConfig, version: ProtocolVersion) -> Self {
        Self {
            version,
            connect_timeout: config.network().connect_timeout(),
            heartbeat_interval: config.network().heartbeat_interval(),
            heartbeat_timeout: config.network().heartbeat_timeout(),
            tcp_nodelay: config.network().tcp_nodelay(),
            max_requests: config.pool().max_requests_per_channel(),
            max_orphans: config.pool().max_orphaned_streams(),
            authenticator: None,
            register_events: false,
            events: None,
        }
    }

    /// Uses the given authenticator.
    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Subscribes to push events and forwards them to `events`.
    pub fn with_events(mut self, events: broadcast::Sender<ServerEvent>) -> Self {
        self.register_events = true;
        self.events = Some(events);
        self
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("version", &self.version)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_requests", &self.max_requests)
            .field("register_events", &self.register_events)
            .finish_non_exhaustive()
    }
}

struct Waiter {
    request: u64,
    tx: oneshot::Sender<Result<Frame>>,
}

/// Stream bookkeeping guarded by one lock.
///
/// A stream id is either free, owned by a waiter, or orphaned. Orphaned ids
/// stay reserved until their late response arrives or the channel closes,
/// so a late response can never be delivered to a newer request.
struct StreamTable {
    ids: StreamIdSet,
    waiters: HashMap<i16, Waiter>,
    orphans: HashSet<i16>,
    next_request: u64,
    draining: bool,
    closed: Option<String>,
}

struct ChannelShared {
    id: ChannelId,
    address: SocketAddr,
    version: u8,
    max_orphans: usize,
    table: Mutex<StreamTable>,
    writer: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    idle: Notify,
    last_read: Mutex<Instant>,
}

impl ChannelShared {
    fn close(&self, reason: &str) {
        let waiters = {
            let mut table = self.table.lock();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.to_string());
            table.orphans.clear();
            std::mem::take(&mut table.waiters)
        };

        if waiters.is_empty() {
            tracing::debug!(channel = %self.id, address = %self.address, reason, "channel closed");
        } else {
            tracing::info!(
                channel = %self.id,
                address = %self.address,
                reason,
                in_flight = waiters.len(),
                "channel closed with requests in flight"
            );
        }
        for (_, waiter) in waiters {
            let _ = waiter
                .tx
                .send(Err(DriverError::ChannelClosed(reason.to_string())));
        }
        self.shutdown.cancel();
        self.idle.notify_waiters();
    }

    fn orphan(&self, stream: i16, request: u64) {
        let over_limit = {
            let mut table = self.table.lock();
            match table.waiters.get(&stream) {
                Some(waiter) if waiter.request == request => {}
                _ => return,
            }
            table.waiters.remove(&stream);
            table.orphans.insert(stream);
            if table.waiters.is_empty() {
                self.idle.notify_waiters();
            }
            table.orphans.len() > self.max_orphans
        };
        tracing::trace!(channel = %self.id, stream, "stream orphaned");
        if over_limit {
            tracing::warn!(
                channel = %self.id,
                address = %self.address,
                max_orphans = self.max_orphans,
                "too many orphaned streams, recycling channel"
            );
            self.close("too many orphaned streams");
        }
    }

    fn complete(&self, frame: Frame) {
        let stream = frame.stream;
        let waiter = {
            let mut table = self.table.lock();
            let waiter = table.waiters.remove(&stream);
            if waiter.is_some() || table.orphans.remove(&stream) {
                table.ids.release(stream);
            }
            if waiter.is_some() && table.waiters.is_empty() {
                self.idle.notify_waiters();
            }
            waiter
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.tx.send(Ok(frame));
            }
            None => {
                tracing::trace!(channel = %self.id, stream, "discarding response without waiter");
            }
        }
    }

    fn fail_stream(&self, stream: i16, error: DriverError) {
        let waiter = {
            let mut table = self.table.lock();
            let waiter = table.waiters.remove(&stream);
            if waiter.is_some() {
                table.ids.release(stream);
            }
            waiter
        };
        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(Err(error));
        }
    }
}

/// A connection to one node carrying many concurrent requests.
pub struct DriverChannel {
    id: ChannelId,
    address: SocketAddr,
    version: ProtocolVersion,
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for DriverChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverChannel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("version", &self.version)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl DriverChannel {
    /// Opens a channel: connects, performs the handshake and starts the
    /// background tasks.
    #[instrument(
        name = "channel.connect",
        skip(config),
        fields(address = %address, version = %config.version)
    )]
    pub async fn connect(address: SocketAddr, config: ChannelConfig) -> Result<Self> {
        let connect_timeout = config.connect_timeout;
        let framed = timeout(connect_timeout, Self::open_and_handshake(address, &config))
            .await
            .map_err(|_| {
                tracing::warn!(timeout = ?connect_timeout, "channel open timed out");
                ConnectionError::Timeout(format!(
                    "opening a channel to {} took longer than {:?}",
                    address, connect_timeout
                ))
            })??;

        let channel = Self::start(address, framed, &config);
        tracing::debug!(channel = %channel.id, "channel ready");
        Ok(channel)
    }

    async fn open_and_handshake(
        address: SocketAddr,
        config: &ChannelConfig,
    ) -> Result<Framed<TcpStream, FrameCodec>> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            ConnectionError::Io(format!("failed to connect to {}: {}", address, e))
        })?;
        stream
            .set_nodelay(config.tcp_nodelay)
            .map_err(|e| ConnectionError::Io(format!("failed to set TCP_NODELAY: {}", e)))?;

        let mut framed = Framed::new(stream, FrameCodec::new());
        handshake(&mut framed, address, config).await?;
        Ok(framed)
    }

    fn start(
        address: SocketAddr,
        framed: Framed<TcpStream, FrameCodec>,
        config: &ChannelConfig,
    ) -> Self {
        let id = ChannelId::new();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            id,
            address,
            version: config.version.value(),
            max_orphans: config.max_orphans,
            table: Mutex::new(StreamTable {
                ids: StreamIdSet::new(config.max_requests),
                waiters: HashMap::new(),
                orphans: HashSet::new(),
                next_request: 0,
                draining: false,
                closed: None,
            }),
            writer: writer_tx,
            shutdown: CancellationToken::new(),
            idle: Notify::new(),
            last_read: Mutex::new(Instant::now()),
        });

        let (sink, stream) = framed.split();
        tokio::spawn(write_loop(Arc::clone(&shared), sink, writer_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), stream, config.events.clone()));
        tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            config.heartbeat_interval,
            config.heartbeat_timeout,
        ));

        Self {
            id,
            address,
            version: config.version,
            shared,
        }
    }

    /// Returns the channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns the address of the node.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the negotiated protocol version.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// Writes a request and returns a future resolving to its response.
    ///
    /// Fails immediately with [`DriverError::Busy`] if no stream id is free
    /// and with [`DriverError::ChannelClosed`] if the channel is closed or
    /// draining. Dropping the returned future before it completes orphans
    /// the stream id.
    pub fn send(&self, opcode: Opcode, body: Bytes) -> Result<ResponseFuture> {
        let (tx, rx) = oneshot::channel();
        let (stream, request) = {
            let mut table = self.shared.table.lock();
            if let Some(reason) = &table.closed {
                return Err(DriverError::ChannelClosed(reason.clone()));
            }
            if table.draining {
                return Err(DriverError::ChannelClosed("channel is draining".to_string()));
            }
            let stream = table.ids.allocate().ok_or(DriverError::Busy(self.address))?;
            table.next_request += 1;
            let request = table.next_request;
            table.waiters.insert(stream, Waiter { request, tx });
            (stream, request)
        };

        let frame = Frame::request(self.shared.version, stream, opcode, body);
        if self.shared.writer.send(frame).is_err() {
            self.shared.fail_stream(
                stream,
                DriverError::ChannelClosed("writer stopped".to_string()),
            );
            return Err(DriverError::ChannelClosed("writer stopped".to_string()));
        }

        Ok(ResponseFuture {
            rx,
            stream,
            request,
            shared: Arc::clone(&self.shared),
            done: false,
        })
    }

    /// Returns the number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.table.lock().waiters.len()
    }

    /// Returns the number of reserved stream ids, orphans included.
    pub fn streams_in_use(&self) -> usize {
        self.shared.table.lock().ids.in_use()
    }

    /// Returns the number of orphaned stream ids.
    pub fn orphaned(&self) -> usize {
        self.shared.table.lock().orphans.len()
    }

    /// Returns the number of stream ids still available.
    pub fn available_streams(&self) -> usize {
        self.shared.table.lock().ids.available()
    }

    /// Returns true once the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.table.lock().closed.is_some()
    }

    /// Returns true if the channel accepts new requests.
    pub fn is_open(&self) -> bool {
        let table = self.shared.table.lock();
        table.closed.is_none() && !table.draining
    }

    /// Returns why the channel closed.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.table.lock().closed.clone()
    }

    /// Returns a future completing when the channel closes.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.shared.shutdown.clone();
        async move { token.cancelled().await }
    }

    /// Closes the channel immediately, failing every pending request with
    /// [`DriverError::ChannelClosed`]. Idempotent.
    pub fn close(&self, reason: &str) {
        self.shared.close(reason);
    }

    /// Stops accepting requests, waits up to `drain_timeout` for in-flight
    /// requests to finish and then closes.
    pub async fn close_gracefully(&self, drain_timeout: Duration) {
        self.shared.table.lock().draining = true;
        let deadline = Instant::now() + drain_timeout;
        loop {
            let notified = self.shared.idle.notified();
            {
                let table = self.shared.table.lock();
                if table.waiters.is_empty() || table.closed.is_some() {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!(
                    channel = %self.id,
                    in_flight = self.in_flight(),
                    "drain timeout elapsed"
                );
                break;
            }
        }
        self.close("channel drained");
    }
}

impl Drop for DriverChannel {
    fn drop(&mut self) {
        self.shared.close("channel dropped");
    }
}

/// The pending response of a request written to a channel.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Frame>>,
    stream: i16,
    request: u64,
    shared: Arc<ChannelShared>,
    done: bool,
}

impl ResponseFuture {
    /// Returns the stream id carrying the request.
    pub fn stream_id(&self) -> i16 {
        self.stream
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("channel", &self.shared.id)
            .field("stream", &self.stream)
            .finish()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(DriverError::ChannelClosed("response dropped".to_string()))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            self.shared.orphan(self.stream, self.request);
        }
    }
}

async fn next_handshake_frame(
    framed: &mut Framed<TcpStream, FrameCodec>,
    address: SocketAddr,
) -> Result<Frame> {
    match framed.next().await {
        Some(frame) => frame,
        None => Err(ConnectionError::Handshake(format!(
            "{} closed the connection during the handshake",
            address
        ))
        .into()),
    }
}

fn handshake_error(frame: Frame, version: u8) -> DriverError {
    match response::parse_error(frame.body) {
        Ok(error) if error.code == ErrorCode::ProtocolError => ConnectionError::ProtocolMismatch {
            version,
            message: error.message,
        }
        .into(),
        Ok(error) if error.code == ErrorCode::BadCredentials => {
            ConnectionError::Authentication(error.message).into()
        }
        Ok(error) => ConnectionError::Handshake(error.to_string()).into(),
        Err(e) => ConnectionError::Handshake(format!("malformed error response: {}", e)).into(),
    }
}

/// Runs STARTUP, the optional authentication exchange and REGISTER.
async fn handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    address: SocketAddr,
    config: &ChannelConfig,
) -> Result<()> {
    let version = config.version.value();
    framed
        .send(Frame::request(
            version,
            HANDSHAKE_STREAM_ID,
            Opcode::Startup,
            body::startup_body(),
        ))
        .await?;

    let reply = next_handshake_frame(framed, address).await?;
    match reply.opcode {
        Opcode::Ready => {}
        Opcode::Authenticate => {
            let class = response::parse_authenticate(reply.body)?;
            authenticate(framed, address, config, &class).await?;
        }
        Opcode::Error => return Err(handshake_error(reply, version)),
        other => {
            return Err(ConnectionError::Handshake(format!(
                "unexpected {:?} in answer to STARTUP",
                other
            ))
            .into())
        }
    }

    if config.register_events {
        framed
            .send(Frame::request(
                version,
                HANDSHAKE_STREAM_ID,
                Opcode::Register,
                body::register_body(&[
                    EVENT_TOPOLOGY_CHANGE,
                    EVENT_STATUS_CHANGE,
                    EVENT_SCHEMA_CHANGE,
                ]),
            ))
            .await?;
        let reply = next_handshake_frame(framed, address).await?;
        match reply.opcode {
            Opcode::Ready => tracing::debug!("registered for push events"),
            Opcode::Error => return Err(handshake_error(reply, version)),
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "unexpected {:?} in answer to REGISTER",
                    other
                ))
                .into())
            }
        }
    }
    Ok(())
}

async fn authenticate(
    framed: &mut Framed<TcpStream, FrameCodec>,
    address: SocketAddr,
    config: &ChannelConfig,
    class: &str,
) -> Result<()> {
    let authenticator = config.authenticator.as_ref().ok_or_else(|| {
        ConnectionError::Authentication(format!(
            "{} requires authentication with {} but no credentials are configured",
            address, class
        ))
    })?;
    let version = config.version.value();
    let mut token = authenticator.initial_response(address, class).await?;

    loop {
        framed
            .send(Frame::request(
                version,
                HANDSHAKE_STREAM_ID,
                Opcode::AuthResponse,
                body::auth_response_body(Some(&token)),
            ))
            .await?;

        let reply = next_handshake_frame(framed, address).await?;
        match reply.opcode {
            Opcode::AuthSuccess => {
                let final_token = response::parse_auth_token(reply.body)?;
                authenticator
                    .on_authentication_success(address, final_token)
                    .await;
                tracing::debug!(authenticator = class, "authenticated");
                return Ok(());
            }
            Opcode::AuthChallenge => {
                let challenge = response::parse_auth_token(reply.body)?;
                token = authenticator.evaluate_challenge(address, challenge).await?;
            }
            Opcode::Error => return Err(handshake_error(reply, version)),
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "unexpected {:?} during authentication",
                    other
                ))
                .into())
            }
        }
    }
}

async fn write_loop(
    shared: Arc<ChannelShared>,
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    let result: Result<()> = async {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => return Ok(()),
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            sink.feed(frame).await?;
            while let Ok(frame) = rx.try_recv() {
                sink.feed(frame).await?;
            }
            sink.flush().await?;
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(channel = %shared.id, error = %e, "write failed");
        shared.close(&format!("write failed: {}", e));
    }
    let _ = sink.close().await;
}

async fn read_loop(
    shared: Arc<ChannelShared>,
    mut stream: FrameStream,
    events: Option<broadcast::Sender<ServerEvent>>,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(DriverError::UnsupportedFrame { opcode, stream: id })) => {
                tracing::warn!(channel = %shared.id, opcode, stream = id, "unsupported frame");
                shared.fail_stream(id, DriverError::UnsupportedFrame { opcode, stream: id });
                break format!("unsupported frame with opcode 0x{:02X}", opcode);
            }
            Some(Err(e)) => break format!("read failed: {}", e),
            None => break "connection closed by peer".to_string(),
        };
        *shared.last_read.lock() = Instant::now();

        if frame.is_compressed() {
            shared.fail_stream(
                frame.stream,
                DriverError::Protocol("compressed frame without negotiated compression".into()),
            );
            break "received a compressed frame".to_string();
        }

        if frame.is_push() {
            dispatch_event(&shared, frame, events.as_ref());
            continue;
        }
        shared.complete(frame);
    };

    shared.close(&reason);
}

fn dispatch_event(
    shared: &ChannelShared,
    frame: Frame,
    events: Option<&broadcast::Sender<ServerEvent>>,
) {
    if frame.opcode != Opcode::Event {
        tracing::debug!(channel = %shared.id, opcode = ?frame.opcode, "ignoring push frame");
        return;
    }
    match ServerEvent::parse(frame.body) {
        Ok(event) => {
            tracing::debug!(channel = %shared.id, event = %event, "push event");
            if let Some(events) = events {
                let _ = events.send(event);
            }
        }
        Err(e) => tracing::warn!(channel = %shared.id, error = %e, "malformed push event"),
    }
}

async fn heartbeat_loop(shared: Arc<ChannelShared>, period: Duration, wait: Duration) {
    let mut due = Instant::now() + period;
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            _ = sleep_until(due) => {}
        }
        let quiet_until = *shared.last_read.lock() + period;
        if quiet_until > Instant::now() {
            due = quiet_until;
            continue;
        }
        due = Instant::now() + period;

        let pending = {
            let (tx, rx) = oneshot::channel();
            let mut table = shared.table.lock();
            if table.closed.is_some() {
                return;
            }
            let Some(stream) = table.ids.allocate() else {
                tracing::trace!(channel = %shared.id, "skipping heartbeat, no free stream id");
                continue;
            };
            table.next_request += 1;
            let request = table.next_request;
            table.waiters.insert(stream, Waiter { request, tx });
            let frame = Frame::request(shared.version, stream, Opcode::Options, Bytes::new());
            if shared.writer.send(frame).is_err() {
                return;
            }
            ResponseFuture {
                rx,
                stream,
                request,
                shared: Arc::clone(&shared),
                done: false,
            }
        };

        match timeout(wait, pending).await {
            Ok(Ok(frame)) if frame.opcode == Opcode::Supported => {
                tracing::trace!(channel = %shared.id, "heartbeat acknowledged");
            }
            Ok(Ok(frame)) => {
                tracing::debug!(channel = %shared.id, opcode = ?frame.opcode, "unexpected heartbeat answer");
            }
            Ok(Err(_)) => return,
            Err(_) => {
                let error = ConnectionError::HeartbeatTimeout(format!(
                    "no answer from {} within {:?}",
                    shared.address, wait
                ));
                tracing::warn!(channel = %shared.id, error = %error, "heartbeat failed");
                shared.close(&error.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_uniqueness() {
        let a = ChannelId::new();
        let b = ChannelId::new();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId::new();
        assert_eq!(id.to_string(), format!("chan-{}", id.value()));
    }

    #[test]
    fn test_channel_config_from_driver_config() {
        let config = DriverConfig::builder()
            .pool(|p| p.max_requests_per_channel(64))
            .build()
            .unwrap();
        let channel = ChannelConfig::from_config(&config, ProtocolVersion::V3);
        assert_eq!(channel.version, ProtocolVersion::V3);
        assert_eq!(channel.max_requests, 64);
        assert!(!channel.register_events);

        let (tx, _rx) = broadcast::channel(4);
        assert!(channel.with_events(tx).register_events);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let config = ChannelConfig::from_config(&DriverConfig::default(), ProtocolVersion::V4);
        let err = DriverChannel::connect(address, config).await.unwrap_err();
        assert!(matches!(err, DriverError::Connection(ConnectionError::Io(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut config = ChannelConfig::from_config(&DriverConfig::default(), ProtocolVersion::V4);
        config.connect_timeout = Duration::from_millis(100);
        let err = DriverChannel::connect(address, config).await.unwrap_err();
        assert!(matches!(err, DriverError::Connection(ConnectionError::Timeout(_))));
    }
}

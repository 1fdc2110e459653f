//! # Client Call Engine
//!
//! A `Client` owns one connection to one backend. Calls are correlated by
//! sequence number: each request registers a completion slot in the pending
//! table before it is written, and the connection's single read task removes
//! and fills that slot when the matching response arrives. Responses may come
//! back in any order.
//!
//! ## Completion
//!
//! A pending call ends exactly once. Whoever removes its entry from the table
//! owns the completion: the read task on a response, the waiter on deadline,
//! or the teardown path when the connection dies. Losing that race is
//! harmless because the entry is already gone.
//!
//! ## Writes
//!
//! Requests are encoded by the caller and handed whole to the connection's
//! write task through a bounded queue. A frame is either queued in full or
//! not at all, so dropping a call future at any point cannot leave part of a
//! frame on the socket.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tidewire::CPU_IDLE_KEY;
use tidewire::Compression;
use tidewire::Message;
use tidewire::MessageType;
use tidewire::Metadata;
use tidewire::Pool;
use tidewire::Registry;
use tidewire::RESPONSE_ERROR_KEY;
use tidewire::SERVER_TIMEOUT_KEY;
use tidewire::Serialization;
use tidewire::Status;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;
use tracing::warn;

use crate::addr::Endpoint;
use crate::balance::Strategy;
use crate::breaker::Breaker;
use crate::breaker::SimpleBreaker;
use crate::context::CallContext;
use crate::coord;

// ============================================================================
//  ERRORS
// ============================================================================

#[derive(Debug, Clone)]
pub enum Error {
    /// Encoding or decoding failed locally.
    Wire(tidewire::Error),
    Io(String),
    Connect(String),
    /// The connection ended before the call completed.
    ConnectionClosed,
    DeadlineExceeded,
    /// The server answered with an error status.
    Remote(String),
    BreakerOpen,
    NoBackend,
    InvalidEndpoint(String),
    Coordination(coord::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "{}", e),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Connect(msg) => write!(f, "connect failed: {}", msg),
            Self::ConnectionClosed => write!(f, "connection is closing"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Remote(msg) => write!(f, "{}", msg),
            Self::BreakerOpen => write!(f, "circuit breaker is open"),
            Self::NoBackend => write!(f, "no available service"),
            Self::InvalidEndpoint(key) => write!(f, "invalid endpoint: {}", key),
            Self::Coordination(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<tidewire::Error> for Error {
    fn from(e: tidewire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<coord::Error> for Error {
    fn from(e: coord::Error) -> Self {
        Self::Coordination(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
//  OPTIONS
// ============================================================================

#[derive(Clone)]
pub struct ClientOptions {
    pub serialization: Serialization,
    pub compression: Compression,
    /// Bound on each response frame read and each request frame write.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    /// Balancer used by `DiscoveryClient`.
    pub strategy: Strategy,
    pub heartbeat: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub breaker: Arc<dyn Breaker>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Codecs and compressors beyond the built-in kinds.
    pub registry: Arc<Registry>,
}

impl ClientOptions {
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

    fn heartbeat_interval(&self) -> Duration {
        non_zero_or(self.heartbeat_interval, Self::DEFAULT_HEARTBEAT_INTERVAL)
    }

    fn heartbeat_timeout(&self) -> Duration {
        non_zero_or(self.heartbeat_timeout, Self::DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            serialization: Serialization::MSGPACK,
            compression: Compression::GZIP,
            read_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            strategy: Strategy::RoundRobin,
            heartbeat: true,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: Self::DEFAULT_HEARTBEAT_TIMEOUT,
            tcp_keepalive: Duration::from_secs(60),
            breaker: Arc::new(SimpleBreaker::default()),
            tls: None,
            registry: Arc::new(Registry::new()),
        }
    }
}

fn non_zero_or(d: Duration, default: Duration) -> Duration {
    if d.is_zero() { default } else { d }
}

// ============================================================================
//  CONNECTION STATE
// ============================================================================

/// Request frames the write task may hold before callers wait for room.
pub(crate) const OUTBOUND_FRAMES: usize = 128;

/// A decoded response waiting to be turned into a typed reply.
struct Response {
    status: Status,
    serialization: Serialization,
    metadata: Metadata,
    payload: Vec<u8>,
    registry: Arc<Registry>,
}

type Slot = oneshot::Sender<Result<Response>>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State the read task and waiters share with the client.
struct Shared {
    pending: DashMap<u64, Slot>,
    closed: AtomicBool,
    cpu_idle: AtomicU64,
}

impl Shared {
    /// Completes `seq` if it is still pending.
    fn complete(&self, seq: u64, result: Result<Response>) -> bool {
        match self.pending.remove(&seq) {
            Some((_, slot)) => {
                let _ = slot.send(result);
                true
            }
            None => false,
        }
    }

    /// Marks the connection closed and fails everything still pending.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let seqs: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for seq in seqs {
            self.complete(seq, Err(Error::ConnectionClosed));
        }
    }
}

struct Inner {
    options: ClientOptions,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    seq: AtomicU64,
    messages: Arc<Pool<Message>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.shared.shutdown();
    }
}

// ============================================================================
//  CLIENT
// ============================================================================

/// A connection to one backend. Cloning shares the connection; it is torn
/// down by `close` or when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Dials `key` (`network@host:port`) and starts the read task and, if
    /// enabled, the heartbeat ticker.
    pub async fn connect(key: &str, options: ClientOptions) -> Result<Self> {
        let endpoint = Endpoint::parse(key).ok_or_else(|| Error::InvalidEndpoint(key.to_owned()))?;
        if !matches!(endpoint.network.as_str(), "tcp" | "tcp4" | "tcp6") {
            return Err(Error::InvalidEndpoint(key.to_owned()));
        }

        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&endpoint.address))
            .await
            .map_err(|_| Error::Connect(format!("{}: timed out", key)))?
            .map_err(|e| Error::Connect(format!("{}: {}", key, e)))?;
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let keepalive = socket2::TcpKeepalive::new().with_time(options.tcp_keepalive);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        let (reader, writer): (BoxedReader, BoxedWriter) = match &options.tls {
            Some(config) => {
                let name = ServerName::try_from(endpoint.host().to_owned())
                    .map_err(|_| Error::InvalidEndpoint(key.to_owned()))?;
                let connector = TlsConnector::from(config.clone());
                let tls = tokio::time::timeout(options.connect_timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| Error::Connect(format!("{}: tls handshake timed out", key)))?
                    .map_err(|e| Error::Connect(format!("{}: {}", key, e)))?;
                let (r, w) = tokio::io::split(tls);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        Ok(Self::start(reader, writer, remote_addr, options))
    }

    /// Runs a client over an established stream pair.
    pub(crate) fn start(reader: BoxedReader, writer: BoxedWriter, remote_addr: SocketAddr, options: ClientOptions) -> Self {
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            cpu_idle: AtomicU64::new(0f64.to_bits()),
        });
        let (outbound, frames) = mpsc::channel(OUTBOUND_FRAMES);
        let inner = Arc::new(Inner {
            remote_addr,
            shared: shared.clone(),
            outbound,
            seq: AtomicU64::new(0),
            messages: Message::pool(64),
            tasks: parking_lot::Mutex::new(Vec::new()),
            options,
        });

        let timeout = inner.options.read_timeout;
        let mut tasks = vec![
            tokio::spawn(read_loop(
                shared.clone(),
                reader,
                inner.messages.clone(),
                inner.options.registry.clone(),
                timeout,
                remote_addr,
            )),
            tokio::spawn(write_loop(shared, writer, frames, timeout, remote_addr)),
        ];
        if inner.options.heartbeat {
            let interval = inner.options.heartbeat_interval();
            tasks.push(tokio::spawn(heartbeat_loop(Arc::downgrade(&inner), interval)));
        }
        *inner.tasks.lock() = tasks;

        Self { inner }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Idle-CPU percentage from the most recent heartbeat, `0.0` before one.
    pub fn cpu_idle(&self) -> f64 {
        f64::from_bits(self.inner.shared.cpu_idle.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Stops background tasks, closes the socket and fails pending calls.
    pub async fn close(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        self.inner.shared.shutdown();
        for task in tasks {
            task.abort();
            // the stream halves drop with their tasks
            let _ = task.await;
        }
    }

    /// Sends a request without waiting for its response.
    ///
    /// Failures before the request reaches the socket are reported through
    /// the returned `Caller`, which is then already complete.
    pub async fn async_call<A, R>(&self, ctx: &CallContext, path: &str, method: &str, arg: &A) -> Caller<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let shared = &self.inner.shared;
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        shared.pending.insert(seq, slot);

        let caller = Caller {
            path: path.to_owned(),
            method: method.to_owned(),
            seq,
            deadline: ctx.deadline,
            rx,
            shared: Some(shared.clone()),
            _reply: PhantomData,
        };

        // teardown may have drained the table before our insert landed
        if self.is_closed() {
            shared.complete(seq, Err(Error::ConnectionClosed));
            return caller;
        }
        if let Err(e) = self.send_request(seq, ctx, path, method, arg).await {
            shared.complete(seq, Err(e));
        }
        caller
    }

    /// Sends a request and waits for the typed reply. Response metadata is
    /// copied into `ctx.response_metadata`.
    pub async fn call<A, R>(&self, ctx: &mut CallContext, path: &str, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let done = self.async_call(ctx, path, method, arg).await.wait().await;
        ctx.response_metadata = done.response_metadata;
        done.result
    }

    /// Sends one heartbeat and records the reported idle-CPU value.
    pub async fn heartbeat(&self) -> Result<Option<f64>> {
        let ctx = CallContext::new().with_timeout(self.inner.options.heartbeat_timeout());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();

        let done = self.async_call::<i64, i64>(&ctx, "", "", &now).await.wait().await;
        done.result?;

        let idle = done.response_metadata.get(CPU_IDLE_KEY).and_then(|v| v.parse::<f64>().ok());
        if let Some(idle) = idle {
            self.inner.shared.cpu_idle.store(idle.to_bits(), Ordering::Relaxed);
            debug!(remote = %self.inner.remote_addr, cpu_idle = idle, "heartbeat");
        }
        Ok(idle)
    }

    async fn send_request<A>(&self, seq: u64, ctx: &CallContext, path: &str, method: &str, arg: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        let options = &self.inner.options;
        let frame = {
            let mut msg = self.inner.messages.acquire();
            msg.header.set_message_type(MessageType::Request);
            msg.header.set_seq(seq);
            msg.header.set_heartbeat(path.is_empty() || method.is_empty());
            msg.header.set_serialization(options.serialization);
            msg.header.set_compression(options.compression);
            msg.path.push_str(path);
            msg.method.push_str(method);
            msg.metadata.extend(ctx.request_metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(left) = ctx.remaining() {
                msg.metadata.insert(SERVER_TIMEOUT_KEY.to_owned(), left.as_millis().to_string());
            }
            msg.payload = options.registry.encode(options.serialization, arg)?;
            msg.encode_with(&options.registry)?
        };

        let bound = Instant::now() + options.read_timeout;
        let bound = ctx.deadline.map_or(bound, |deadline| deadline.min(bound));
        match tokio::time::timeout_at(bound, self.inner.outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) if ctx.deadline.is_some_and(|deadline| deadline <= bound) => Err(Error::DeadlineExceeded),
            Err(_) => Err(Error::Io("write queue stalled".into())),
        }
    }
}

// ============================================================================
//  CALLER
// ============================================================================

/// An issued call awaiting its response.
pub struct Caller<R> {
    path: String,
    method: String,
    seq: u64,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<Result<Response>>,
    shared: Option<Arc<Shared>>,
    _reply: PhantomData<fn() -> R>,
}

/// The outcome of a finished call.
#[derive(Debug)]
pub struct Completion<R> {
    pub path: String,
    pub method: String,
    pub seq: u64,
    pub response_metadata: Metadata,
    pub result: Result<R>,
}

impl<R> Completion<R> {
    pub fn into_result(self) -> Result<R> {
        self.result
    }
}

impl<R: DeserializeOwned> Caller<R> {
    /// A caller that is already complete with `error`.
    pub(crate) fn failed(path: &str, method: &str, error: Error) -> Self {
        let (slot, rx) = oneshot::channel();
        let _ = slot.send(Err(error));
        Self {
            path: path.to_owned(),
            method: method.to_owned(),
            seq: 0,
            deadline: None,
            rx,
            shared: None,
            _reply: PhantomData,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the response or the context deadline, whichever is first.
    pub async fn wait(mut self) -> Completion<R> {
        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    let removed = self.shared.as_ref().is_some_and(|s| s.pending.remove(&self.seq).is_some());
                    if removed {
                        Ok(Err(Error::DeadlineExceeded))
                    } else {
                        // completion won the race and is already on its way
                        (&mut self.rx).await
                    }
                }
            },
            None => (&mut self.rx).await,
        };

        let (response_metadata, result) = match outcome {
            Ok(Ok(resp)) => decode_reply(resp),
            Ok(Err(e)) => (Metadata::new(), Err(e)),
            Err(_) => (Metadata::new(), Err(Error::ConnectionClosed)),
        };

        Completion {
            path: std::mem::take(&mut self.path),
            method: std::mem::take(&mut self.method),
            seq: self.seq,
            response_metadata,
            result,
        }
    }
}

impl<R> Drop for Caller<R> {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.pending.remove(&self.seq);
        }
    }
}

fn decode_reply<R: DeserializeOwned>(resp: Response) -> (Metadata, Result<R>) {
    let result = match resp.status {
        Status::Error => {
            let msg = resp.metadata.get(RESPONSE_ERROR_KEY).cloned().unwrap_or_default();
            Err(Error::Remote(msg))
        }
        Status::Normal => resp.registry.decode(resp.serialization, &resp.payload).map_err(Error::from),
    };
    (resp.metadata, result)
}

// ============================================================================
//  BACKGROUND TASKS
// ============================================================================

async fn read_loop(
    shared: Arc<Shared>,
    reader: BoxedReader,
    messages: Arc<Pool<Message>>,
    registry: Arc<Registry>,
    read_timeout: Duration,
    remote: SocketAddr,
) {
    let mut reader = BufReader::new(reader);

    let reason = loop {
        let mut msg = messages.acquire();
        match tokio::time::timeout(read_timeout, msg.read_from_with(&mut reader, &registry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break e.to_string(),
            Err(_) => break "read timed out".to_owned(),
        }
        if !matches!(msg.header.message_type(), Ok(MessageType::Response)) {
            break "peer sent a request frame".to_owned();
        }

        let seq = msg.header.seq();
        let serialization = msg.header.serialization();
        let response = msg
            .header
            .status()
            .map(|status| Response {
                status,
                serialization,
                metadata: std::mem::take(&mut msg.metadata),
                payload: std::mem::take(&mut msg.payload),
                registry: registry.clone(),
            })
            .map_err(Error::from);
        // late responses for abandoned calls are dropped here
        shared.complete(seq, response);
    };

    debug!(remote = %remote, reason = %reason, "connection closed");
    shared.shutdown();
}

/// Writes queued request frames in order until the stream fails.
async fn write_loop(
    shared: Arc<Shared>,
    mut writer: BoxedWriter,
    mut frames: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
    remote: SocketAddr,
) {
    while let Some(frame) = frames.recv().await {
        let written = tokio::time::timeout(write_timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;
        let reason = match written {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write timed out".to_owned(),
        };
        // a partial frame leaves the stream unusable
        debug!(remote = %remote, reason = %reason, "request write failed");
        shared.shutdown();
        break;
    }
    let _ = writer.shutdown().await;
}

async fn heartbeat_loop(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        let client = Client { inner };
        if client.is_closed() {
            return;
        }
        if let Err(e) = client.heartbeat().await {
            warn!(remote = %client.remote_addr(), error = %e, "heartbeat failed");
        }
    }
}

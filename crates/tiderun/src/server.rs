//! # Server Dispatch Engine
//!
//! The server accepts connections, reads request frames and runs each request
//! in its own task, so a slow method never holds up the requests queued
//! behind it on the same connection. Responses are written back as they
//! finish, in whatever order that is.
//!
//! ## Registry
//!
//! A `Handler` binds a service value to a set of named methods. Each method
//! is a closure that receives the service, the call context, the decoded
//! argument and a reply slot to fill in. The registry is built before serving
//! and only read afterwards.
//!
//! ```ignore
//! let add = Handler::new("A", Arith).method("Add", |_svc: &Arith, _ctx, arg: i64, reply: &mut i64| {
//!     Box::pin(async move {
//!         *reply = arg + 1;
//!         anyhow::Ok(())
//!     })
//! });
//! server.register(add);
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tidewire::CPU_IDLE_KEY;
use tidewire::Message;
use tidewire::MessageType;
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
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::context::CallContext;
use crate::health::FixedHealth;
use crate::health::HealthMetric;
use crate::registration::Plugin;

// ============================================================================
//  ERRORS
// ============================================================================

#[derive(Debug)]
pub enum Error {
    Io(String),
    /// A plugin failed to register; the server does not start.
    Plugin(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Plugin(msg) => write!(f, "plugin registration failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single request failed. Rendered into the response's error metadata.
#[derive(Debug)]
pub enum DispatchError {
    ServiceNotFound(String),
    MethodNotFound { service: String, method: String },
    /// Argument decoding or reply encoding failed.
    Wire(tidewire::Error),
    Handler(anyhow::Error),
    Panicked(String),
    DeadlineExceeded,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceNotFound(name) => write!(f, "service not found: {}", name),
            Self::MethodNotFound { service, method } => write!(f, "method not found: {}.{}", service, method),
            Self::Wire(e) => write!(f, "{}", e),
            Self::Handler(e) => write!(f, "{:#}", e),
            Self::Panicked(msg) => write!(f, "internal error: handler panicked: {}", msg),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<tidewire::Error> for DispatchError {
    fn from(e: tidewire::Error) -> Self {
        Self::Wire(e)
    }
}

// ============================================================================
//  REGISTRY
// ============================================================================

/// Future returned by a registered method.
pub type MethodFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

type Invoker = Box<
    dyn for<'a> Fn(
            &'a mut CallContext,
            &'a Registry,
            Serialization,
            &'a [u8],
        ) -> BoxFuture<'a, std::result::Result<Vec<u8>, DispatchError>>
        + Send
        + Sync,
>;

/// One invocable method of a handler.
pub struct MethodDescriptor {
    pub name: String,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    invoker: Invoker,
}

impl MethodDescriptor {
    /// Decodes `payload`, runs the method and encodes its reply, both in the
    /// codec `registry` holds for `serialization`.
    pub fn invoke<'a>(
        &'a self,
        ctx: &'a mut CallContext,
        registry: &'a Registry,
        serialization: Serialization,
        payload: &'a [u8],
    ) -> BoxFuture<'a, std::result::Result<Vec<u8>, DispatchError>> {
        (self.invoker)(ctx, registry, serialization, payload)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

/// A named service and its methods.
#[derive(Debug)]
pub struct Handler {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl Handler {
    pub fn new<S>(name: impl Into<String>, service: S) -> HandlerBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        HandlerBuilder {
            name: name.into(),
            service: Arc::new(service),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }
}

pub struct HandlerBuilder<S> {
    name: String,
    service: Arc<S>,
    methods: HashMap<String, MethodDescriptor>,
}

impl<S> HandlerBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Adds a method. Empty and duplicate names are skipped with a warning.
    ///
    /// Reply values come from a per-method pool and start at `R::default()`.
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + Sync + 'static,
        F: for<'a> Fn(&'a S, &'a mut CallContext, A, &'a mut R) -> MethodFuture<'a> + Send + Sync + 'static,
    {
        if name.is_empty() {
            warn!(service = %self.name, "skipping method with empty name");
            return self;
        }
        if self.methods.contains_key(name) {
            warn!(service = %self.name, method = name, "skipping duplicate method");
            return self;
        }

        let service = self.service.clone();
        let replies = Pool::<R>::with_default(64);
        let f = Arc::new(f);
        let invoker = invoker(move |ctx, registry, serialization, payload| {
            Box::pin(call_method::<S, A, R, F>(
                service.clone(),
                replies.clone(),
                f.clone(),
                ctx,
                registry,
                serialization,
                payload,
            ))
        });

        self.methods.insert(name.to_owned(), MethodDescriptor {
            name: name.to_owned(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            invoker,
        });
        self
    }
}

fn invoker<F>(f: F) -> Invoker
where
    F: for<'a> Fn(
            &'a mut CallContext,
            &'a Registry,
            Serialization,
            &'a [u8],
        ) -> BoxFuture<'a, std::result::Result<Vec<u8>, DispatchError>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

async fn call_method<S, A, R, F>(
    service: Arc<S>,
    replies: Arc<Pool<R>>,
    f: Arc<F>,
    ctx: &mut CallContext,
    registry: &Registry,
    serialization: Serialization,
    payload: &[u8],
) -> std::result::Result<Vec<u8>, DispatchError>
where
    S: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Default + Send + Sync + 'static,
    F: for<'a> Fn(&'a S, &'a mut CallContext, A, &'a mut R) -> MethodFuture<'a> + Send + Sync + 'static,
{
    let arg: A = registry.decode(serialization, payload)?;
    let mut reply = replies.acquire();
    (*f)(&*service, ctx, arg, &mut *reply).await.map_err(DispatchError::Handler)?;
    Ok(registry.encode(serialization, &*reply)?)
}

impl<S> From<HandlerBuilder<S>> for Handler {
    fn from(builder: HandlerBuilder<S>) -> Self {
        Handler { name: builder.name, methods: builder.methods }
    }
}

// ============================================================================
//  SERVER
// ============================================================================

#[derive(Clone)]
pub struct ServerOptions {
    /// Bound on reading each request frame; an idle connection is dropped.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub health: Arc<dyn HealthMetric>,
    /// Codecs and compressors beyond the built-in kinds.
    pub registry: Arc<Registry>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            tls: None,
            health: Arc::new(FixedHealth(0.0)),
            registry: Arc::new(Registry::new()),
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

/// Cloning shares the server; any clone may call `shutdown`.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    options: ServerOptions,
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    active: Mutex<HashMap<SocketAddr, AbortHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    messages: Arc<Pool<Message>>,
    stop: watch::Sender<bool>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                handlers: RwLock::new(HashMap::new()),
                plugins: RwLock::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
                messages: Message::pool(256),
                stop: watch::Sender::new(false),
            }),
        }
    }

    /// Registers a handler under its name, replacing any previous one.
    pub fn register(&self, handler: impl Into<Handler>) {
        let handler = handler.into();
        if handler.methods.is_empty() {
            warn!(service = %handler.name, "registered handler has no methods");
        }
        self.inner.handlers.write().insert(handler.name.clone(), Arc::new(handler));
    }

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.inner.plugins.write().push(plugin);
    }

    /// Address of the listener once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Binds `addr` and serves until `shutdown`.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Registers plugins, then accepts connections until `shutdown`.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);

        let plugins = self.inner.plugins.read().clone();
        for plugin in plugins {
            if let Err(e) = plugin.register().await {
                error!(error = %format!("{:#}", e), "plugin registration failed");
                return Err(Error::Plugin(format!("{:#}", e)));
            }
        }

        let acceptor = self.inner.options.tls.clone().map(TlsAcceptor::from);
        let mut stop = self.inner.stop.subscribe();
        info!(addr = %local, tls = acceptor.is_some(), "server listening");

        loop {
            let stopped = *stop.borrow_and_update();
            if stopped {
                break;
            }
            let (stream, peer) = tokio::select! {
                biased;
                _ = stop.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        continue;
                    }
                },
            };
            debug!(remote = %peer, "accepted connection");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(remote = %peer, error = %e, "set nodelay failed");
            }

            let inner = self.inner.clone();
            let acceptor = acceptor.clone();
            let mut active = self.inner.active.lock();
            // shutdown drains the set under this lock after raising the flag
            if *self.inner.stop.borrow() {
                debug!(remote = %peer, "dropping connection accepted during shutdown");
                break;
            }
            let task = tokio::spawn(async move {
                handle_stream(&inner, stream, peer, acceptor).await;
                inner.active.lock().remove(&peer);
            });
            active.insert(peer, task.abort_handle());
        }

        info!(addr = %local, "server stopped accepting");
        Ok(())
    }

    /// Stops accepting, drops every open connection and closes plugins.
    pub async fn shutdown(&self) {
        self.inner.stop.send_replace(true);

        let active: Vec<_> = self.inner.active.lock().drain().collect();
        for (peer, handle) in active {
            debug!(remote = %peer, "closing connection");
            handle.abort();
        }

        let plugins: Vec<_> = self.inner.plugins.read().clone();
        for plugin in plugins {
            if let Err(e) = plugin.close().await {
                warn!(error = %format!("{:#}", e), "plugin close failed");
            }
        }
    }
}

async fn handle_stream(inner: &Arc<Inner>, stream: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>) {
    match acceptor {
        Some(acceptor) => match tokio::time::timeout(inner.options.read_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => {
                let (reader, writer) = tokio::io::split(tls);
                serve_conn(inner, reader, Box::new(writer), peer).await;
            }
            Ok(Err(e)) => warn!(remote = %peer, error = %e, "tls handshake failed"),
            Err(_) => warn!(remote = %peer, "tls handshake timed out"),
        },
        None => {
            let (reader, writer) = stream.into_split();
            serve_conn(inner, reader, Box::new(writer), peer).await;
        }
    }
}

async fn serve_conn<R>(inner: &Arc<Inner>, reader: R, writer: BoxedWriter, peer: SocketAddr)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::with_capacity(1024, reader);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let mut req = inner.messages.acquire();
        match tokio::time::timeout(inner.options.read_timeout, req.read_from_with(&mut reader, &inner.options.registry)).await {
            Ok(Ok(())) => {}
            Ok(Err(tidewire::Error::Closed)) => {
                debug!(remote = %peer, "client closed the connection");
                break;
            }
            Ok(Err(e)) => {
                warn!(remote = %peer, error = %e, "failed to read request");
                break;
            }
            Err(_) => {
                debug!(remote = %peer, "connection idle past read timeout");
                break;
            }
        }
        if !matches!(req.header.message_type(), Ok(MessageType::Request)) {
            warn!(remote = %peer, "peer sent a non-request frame");
            break;
        }

        let inner = inner.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let mut resp = inner.messages.acquire();
            handle_request(&inner, &req, &mut resp, peer).await;
            req.release();
            write_response(&inner, &writer, &mut resp, peer).await;
        });
    }
}

/// Fills `resp` with the answer to `req`.
async fn handle_request(inner: &Inner, req: &Message, resp: &mut Message, peer: SocketAddr) {
    resp.prepare_response(req);

    if req.is_heartbeat() {
        resp.header.set_heartbeat(true);
        let idle = inner.options.health.cpu_idle();
        resp.metadata.insert(CPU_IDLE_KEY.to_owned(), idle.to_string());
        resp.payload.extend_from_slice(&req.payload);
        return;
    }

    if let Err(e) = dispatch(inner, req, resp, peer).await {
        debug!(remote = %peer, path = %req.path, method = %req.method, error = %e, "request failed");
        fail(resp, &e);
    }
}

fn fail(resp: &mut Message, e: &DispatchError) {
    resp.header.set_status(Status::Error);
    resp.payload.clear();
    resp.metadata.insert(RESPONSE_ERROR_KEY.to_owned(), e.to_string());
}

async fn dispatch(inner: &Inner, req: &Message, resp: &mut Message, peer: SocketAddr) -> std::result::Result<(), DispatchError> {
    let handler = inner
        .handlers
        .read()
        .get(&req.path)
        .cloned()
        .ok_or_else(|| DispatchError::ServiceNotFound(req.path.clone()))?;
    let method = handler.method(&req.method).ok_or_else(|| DispatchError::MethodNotFound {
        service: req.path.clone(),
        method: req.method.clone(),
    })?;
    let serialization = req.header.serialization();
    inner.options.registry.codec(serialization)?;

    let mut ctx = CallContext::new();
    ctx.remote_addr = Some(peer);
    ctx.request_metadata = req.metadata.clone();
    ctx.deadline = req
        .metadata
        .get(SERVER_TIMEOUT_KEY)
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let deadline = ctx.deadline;
    let outcome = {
        let call =
            AssertUnwindSafe(method.invoke(&mut ctx, &inner.options.registry, serialization, &req.payload)).catch_unwind();
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call).await.map_err(|_| DispatchError::DeadlineExceeded)?,
            None => call.await,
        }
    };
    resp.metadata.extend(std::mem::take(&mut ctx.response_metadata));

    match outcome {
        Ok(reply) => {
            resp.payload = reply?;
            Ok(())
        }
        Err(panic) => {
            let msg = panic_message(&*panic);
            error!(
                path = %req.path,
                method = %req.method,
                panic = %msg,
                backtrace = %std::backtrace::Backtrace::force_capture(),
                "handler panicked"
            );
            Err(DispatchError::Panicked(msg))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

async fn write_response(inner: &Inner, writer: &SharedWriter, resp: &mut Message, peer: SocketAddr) {
    let registry = &inner.options.registry;
    let frame = match resp.encode_with(registry) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(remote = %peer, error = %e, "failed to encode response");
            fail(resp, &DispatchError::Wire(e));
            match resp.encode_with(registry) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };

    let mut writer = writer.lock().await;
    let written = tokio::time::timeout(inner.options.write_timeout, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(remote = %peer, error = %e, "failed to write response"),
        Err(_) => debug!(remote = %peer, "response write timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arith;

    fn arith() -> Handler {
        Handler::new("A", Arith)
            .method("Add", |_svc: &Arith, _ctx: &mut CallContext, arg: i64, reply: &mut i64| {
                Box::pin(async move {
                    *reply = arg + 1;
                    anyhow::Ok(())
                })
            })
            .method("Add", |_svc: &Arith, _ctx: &mut CallContext, _arg: i64, _reply: &mut i64| {
                Box::pin(async move { anyhow::Ok(()) })
            })
            .method("", |_svc: &Arith, _ctx: &mut CallContext, _arg: i64, _reply: &mut i64| {
                Box::pin(async move { anyhow::Ok(()) })
            })
            .method("Fail", |_svc: &Arith, _ctx: &mut CallContext, _arg: i64, _reply: &mut i64| {
                Box::pin(async move { Err::<(), _>(anyhow::anyhow!("boom")) })
            })
            .into()
    }

    fn request(path: &str, method: &str, arg: i64) -> Message {
        let mut req = Message::new();
        req.header.set_message_type(MessageType::Request);
        req.header.set_seq(9);
        req.header.set_serialization(Serialization::JSON);
        req.path.push_str(path);
        req.method.push_str(method);
        req.payload = Serialization::JSON.encode(&arg).unwrap();
        req
    }

    fn server() -> Server {
        let server = Server::new(ServerOptions { health: Arc::new(FixedHealth(12.5)), ..ServerOptions::default() });
        server.register(arith());
        server
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_registry_skips_bad_methods() {
        let handler = arith();
        assert_eq!(handler.name(), "A");
        assert_eq!(handler.methods().count(), 2);
        let add = handler.method("Add").unwrap();
        assert_eq!(add.arg_type, "i64");
        assert_eq!(add.reply_type, "i64");
        assert!(handler.method("").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_invokes_method() {
        let server = server();
        let req = request("A", "Add", 41);
        let mut resp = Message::new();
        handle_request(&server.inner, &req, &mut resp, peer()).await;

        assert_eq!(resp.header.status().unwrap(), Status::Normal);
        assert_eq!(resp.header.message_type().unwrap(), MessageType::Response);
        assert_eq!(resp.header.seq(), 9);
        assert_eq!(Serialization::JSON.decode::<i64>(&resp.payload).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_dispatch_misses_become_error_status() {
        let server = server();
        for (path, method, want) in [
            ("B", "Add", "service not found: B"),
            ("A", "Sub", "method not found: A.Sub"),
            ("A", "Fail", "boom"),
        ] {
            let mut resp = Message::new();
            handle_request(&server.inner, &request(path, method, 1), &mut resp, peer()).await;
            assert_eq!(resp.header.status().unwrap(), Status::Error);
            assert!(resp.payload.is_empty());
            let got = resp.metadata.get(RESPONSE_ERROR_KEY).unwrap();
            assert!(got.contains(want), "{}", got);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_skips_registry() {
        let server = server();
        let mut req = request("", "", 7);
        req.header.set_heartbeat(true);
        let mut resp = Message::new();
        handle_request(&server.inner, &req, &mut resp, peer()).await;

        assert!(resp.is_heartbeat());
        assert_eq!(resp.header.status().unwrap(), Status::Normal);
        assert_eq!(resp.metadata.get(CPU_IDLE_KEY).map(String::as_str), Some("12.5"));
        assert_eq!(resp.payload, req.payload);
    }

    #[test]
    fn test_default_options() {
        let opts = ServerOptions::default();
        assert_eq!(opts.read_timeout, Duration::from_secs(30));
        assert_eq!(opts.write_timeout, Duration::from_secs(30));
        assert!(opts.tls.is_none());
        assert_eq!(opts.health.cpu_idle(), 0.0);
    }
}

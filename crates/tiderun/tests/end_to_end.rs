//! Client and server talking over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tidewire::Codec;
use tidewire::Compression;
use tidewire::Compressor;
use tidewire::Registry;
use tidewire::SERVER_TIMEOUT_KEY;
use tidewire::Serialization;
use tiderun::CallContext;
use tiderun::Client;
use tiderun::ClientOptions;
use tiderun::Handler;
use tiderun::Server;
use tiderun::ServerOptions;
use tiderun::client::Error;
use tiderun::health::FixedHealth;
use tiderun::registration::Plugin;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Arith;

impl Arith {
    async fn add(&self, arg: i64, reply: &mut i64) -> anyhow::Result<()> {
        *reply = arg + 1;
        Ok(())
    }

    async fn sleep(&self, ms: u64, reply: &mut u64) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        *reply = ms;
        Ok(())
    }

    async fn divide(&self, pair: (i64, i64), reply: &mut i64) -> anyhow::Result<()> {
        if pair.1 == 0 {
            anyhow::bail!("division by zero");
        }
        *reply = pair.0 / pair.1;
        Ok(())
    }

    async fn explode(&self, _arg: i64, _reply: &mut i64) -> anyhow::Result<()> {
        panic!("kaboom");
    }

    async fn tag(&self, ctx: &mut CallContext, name: String, reply: &mut String) -> anyhow::Result<()> {
        let tenant = ctx.request_metadata.get("tenant").cloned().unwrap_or_default();
        ctx.response_metadata.insert("served-by".into(), "arith".into());
        *reply = format!("{}@{}", name, tenant);
        Ok(())
    }
}

fn arith() -> Handler {
    Handler::new("A", Arith)
        .method("Add", |svc: &Arith, _ctx: &mut CallContext, arg: i64, reply: &mut i64| Box::pin(svc.add(arg, reply)))
        .method("Sleep", |svc: &Arith, _ctx: &mut CallContext, ms: u64, reply: &mut u64| Box::pin(svc.sleep(ms, reply)))
        .method("Divide", |svc: &Arith, _ctx: &mut CallContext, pair: (i64, i64), reply: &mut i64| {
            Box::pin(svc.divide(pair, reply))
        })
        .method("Explode", |svc: &Arith, _ctx: &mut CallContext, arg: i64, reply: &mut i64| {
            Box::pin(svc.explode(arg, reply))
        })
        .method("Tag", |svc: &Arith, ctx: &mut CallContext, name: String, reply: &mut String| {
            Box::pin(svc.tag(ctx, name, reply))
        })
        .into()
}

async fn start(options: ServerOptions) -> (Server, SocketAddr, JoinHandle<tiderun::server::Result<()>>) {
    let server = Server::new(options);
    server.register(arith());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve_listener(listener).await });
    (server, addr, task)
}

fn quiet() -> ClientOptions {
    ClientOptions { heartbeat: false, ..ClientOptions::default() }
}

async fn connect(addr: SocketAddr, options: ClientOptions) -> Client {
    Client::connect(&format!("tcp@{}", addr), options).await.unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_add_under_every_codec() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;

    for serialization in [Serialization::JSON, Serialization::MSGPACK] {
        for compression in [Compression::NONE, Compression::GZIP] {
            let client = connect(addr, ClientOptions { serialization, compression, ..quiet() }).await;
            let mut ctx = CallContext::new();
            let got: i64 = client.call(&mut ctx, "A", "Add", &41i64).await.unwrap();
            assert_eq!(got, 42, "{:?}/{:?}", serialization, compression);
        }
    }
}

#[tokio::test]
async fn test_heartbeat_reports_server_health() {
    let options = ServerOptions { health: Arc::new(FixedHealth(73.5)), ..ServerOptions::default() };
    let (_server, addr, _task) = start(options).await;

    let client = connect(addr, ClientOptions {
        heartbeat_interval: Duration::from_millis(50),
        ..ClientOptions::default()
    })
    .await;
    assert!(eventually(|| client.cpu_idle() == 73.5).await);
    assert_eq!(client.heartbeat().await.unwrap(), Some(73.5));
}

#[tokio::test]
async fn test_unknown_names_fail_the_call_only() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;
    let mut ctx = CallContext::new();

    for (path, method) in [("B", "Add"), ("A", "Sub")] {
        let err = client.call::<i64, i64>(&mut ctx, path, method, &1).await.unwrap_err();
        match err {
            Error::Remote(msg) => assert!(msg.contains("not found"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    let got: i64 = client.call(&mut ctx, "A", "Add", &1i64).await.unwrap();
    assert_eq!(got, 2);
}

#[tokio::test]
async fn test_bad_argument_is_a_call_error() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, ClientOptions { serialization: Serialization::JSON, ..quiet() }).await;
    let mut ctx = CallContext::new();

    let err = client.call::<&str, i64>(&mut ctx, "A", "Add", &"forty-one").await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)), "{:?}", err);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_slow_request_does_not_block_others() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;
    let ctx = CallContext::new();

    let slow = client.async_call::<u64, u64>(&ctx, "A", "Sleep", &300).await;
    let fast = client.async_call::<u64, u64>(&ctx, "A", "Sleep", &1).await;

    let fast = tokio::time::timeout(Duration::from_millis(200), fast.wait()).await.unwrap();
    assert_eq!(fast.result.unwrap(), 1);
    assert_eq!(slow.wait().await.result.unwrap(), 300);
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;

    let calls = (0..64i64).map(|i| {
        let client = client.clone();
        async move {
            let mut ctx = CallContext::new();
            let got: i64 = client.call(&mut ctx, "A", "Add", &i).await.unwrap();
            (i, got)
        }
    });
    for (i, got) in futures::future::join_all(calls).await {
        assert_eq!(got, i + 1);
    }
}

#[tokio::test]
async fn test_handler_error_and_panic_keep_connection() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;
    let mut ctx = CallContext::new();

    let err = client.call::<_, i64>(&mut ctx, "A", "Divide", &(1i64, 0i64)).await.unwrap_err();
    assert_eq!(err.to_string(), "division by zero");

    let err = client.call::<_, i64>(&mut ctx, "A", "Explode", &1i64).await.unwrap_err();
    assert_eq!(err.to_string(), "internal error: handler panicked: kaboom");

    let got: i64 = client.call(&mut ctx, "A", "Divide", &(9i64, 3i64)).await.unwrap();
    assert_eq!(got, 3);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_client_deadline() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;

    let mut ctx = CallContext::new().with_timeout(Duration::from_millis(50));
    let err = client.call::<u64, u64>(&mut ctx, "A", "Sleep", &500).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
}

#[tokio::test]
async fn test_server_enforces_timeout_hint() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;

    // a bare hint with no local deadline leaves the server to time the call out
    let mut ctx = CallContext::new().with_metadata(SERVER_TIMEOUT_KEY, "50");
    let err = client.call::<u64, u64>(&mut ctx, "A", "Sleep", &2000).await.unwrap_err();
    match err {
        Error::Remote(msg) => assert_eq!(msg, "deadline exceeded"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_response_metadata_reaches_caller() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;

    let mut ctx = CallContext::new().with_metadata("tenant", "blue");
    let got: String = client.call(&mut ctx, "A", "Tag", "svc").await.unwrap();
    assert_eq!(got, "svc@blue");
    assert_eq!(ctx.response_metadata.get("served-by").map(String::as_str), Some("arith"));
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let (server, addr, task) = start(ServerOptions::default()).await;
    let client = connect(addr, quiet()).await;
    assert!(eventually(|| server.active_connections() == 1).await);
    assert_eq!(server.local_addr(), Some(addr));

    server.shutdown().await;
    task.await.unwrap().unwrap();
    assert_eq!(server.active_connections(), 0);
    assert!(eventually(|| client.is_closed()).await);

    let refused = Client::connect(&format!("tcp@{}", addr), quiet()).await;
    assert!(matches!(refused, Err(Error::Connect(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connections_racing_shutdown_are_not_kept() {
    for _ in 0..20 {
        let (server, addr, task) = start(ServerOptions::default()).await;
        let dialers: Vec<_> = (0..8)
            .map(|_| tokio::spawn(async move { Client::connect(&format!("tcp@{}", addr), quiet()).await.ok() }))
            .collect();
        tokio::task::yield_now().await;

        server.shutdown().await;
        task.await.unwrap().unwrap();
        assert_eq!(server.active_connections(), 0);
        for dialer in dialers {
            if let Some(client) = dialer.await.unwrap() {
                assert!(eventually(|| client.is_closed()).await);
            }
        }
    }
}

/// Tab-separated `[a, b]` pairs, standing in for a third-party format.
struct PairCodec;

impl Codec for PairCodec {
    fn encode(&self, value: &Value) -> tidewire::Result<Vec<u8>> {
        let text = match value {
            Value::Array(items) => items.iter().map(Value::to_string).collect::<Vec<_>>().join("\t"),
            other => other.to_string(),
        };
        Ok(text.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> tidewire::Result<Value> {
        let text = std::str::from_utf8(bytes).map_err(|e| tidewire::Error::Decode(e.to_string()))?;
        let mut items = text
            .split('\t')
            .map(|part| serde_json::from_str(part).map_err(|e| tidewire::Error::Decode(e.to_string())))
            .collect::<tidewire::Result<Vec<Value>>>()?;
        Ok(if items.len() == 1 { items.remove(0) } else { Value::Array(items) })
    }
}

/// Flips every bit.
struct Invert;

impl Compressor for Invert {
    fn zip(&self, data: &[u8]) -> tidewire::Result<Vec<u8>> {
        Ok(data.iter().map(|b| !b).collect())
    }

    fn unzip(&self, data: &[u8], limit: usize) -> tidewire::Result<Vec<u8>> {
        if data.len() > limit {
            return Err(tidewire::Error::FrameTooLarge { len: data.len(), max: limit });
        }
        self.zip(data)
    }
}

const PAIRS: Serialization = Serialization(7);
const INVERT: Compression = Compression(5);

fn extended() -> Arc<Registry> {
    Arc::new(Registry::new().with_codec(PAIRS, PairCodec).with_compressor(INVERT, Invert))
}

#[tokio::test]
async fn test_registered_kinds_work_end_to_end() {
    let (_server, addr, _task) = start(ServerOptions { registry: extended(), ..ServerOptions::default() }).await;
    let options = ClientOptions {
        serialization: PAIRS,
        compression: INVERT,
        registry: extended(),
        ..quiet()
    };
    let client = connect(addr, options).await;

    let mut ctx = CallContext::new();
    let got: i64 = client.call(&mut ctx, "A", "Divide", &(84i64, 2i64)).await.unwrap();
    assert_eq!(got, 42);
    let got: i64 = client.call(&mut ctx, "A", "Add", &1i64).await.unwrap();
    assert_eq!(got, 2);
}

#[tokio::test]
async fn test_codec_unknown_to_server_fails_the_call_only() {
    let (_server, addr, _task) = start(ServerOptions::default()).await;
    let options = ClientOptions { serialization: PAIRS, registry: extended(), ..quiet() };
    let client = connect(addr, options).await;

    let mut ctx = CallContext::new();
    let err = client.call::<i64, i64>(&mut ctx, "A", "Add", &1).await.unwrap_err();
    match err {
        Error::Remote(msg) => assert_eq!(msg, "unknown serialization kind 7"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!client.is_closed());
}

struct Counting {
    registered: AtomicUsize,
    closed: AtomicUsize,
    fail: bool,
}

#[async_trait::async_trait]
impl Plugin for Counting {
    async fn register(&self) -> anyhow::Result<()> {
        self.registered.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("backend unreachable");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn counting(fail: bool) -> Arc<Counting> {
    Arc::new(Counting { registered: AtomicUsize::new(0), closed: AtomicUsize::new(0), fail })
}

#[tokio::test]
async fn test_plugins_run_around_serving() {
    let plugin = counting(false);
    let server = Server::new(ServerOptions::default());
    server.add_plugin(plugin.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve_listener(listener).await });

    assert!(eventually(|| plugin.registered.load(Ordering::SeqCst) == 1).await);
    server.shutdown().await;
    task.await.unwrap().unwrap();
    assert_eq!(plugin.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_plugin_failure_aborts_startup() {
    let server = Server::new(ServerOptions::default());
    server.add_plugin(counting(true));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let err = server.serve_listener(listener).await.unwrap_err();
    assert!(matches!(err, tiderun::server::Error::Plugin(ref msg) if msg.contains("backend unreachable")));
}

//! tided - demo server and client for the tide RPC framework
//!
//! - `serve` exposes `A.Add` on a TCP address until interrupted, optionally
//!   registered in etcd (`--etcd`, needs the `etcd` feature).
//! - `call` dials one server, or discovers one through etcd, and invokes `A.Add`.
//! - `demo` runs several lease-registered servers against an in-memory
//!   coordination store and spreads calls across them through discovery.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tiderun::CallContext;
use tiderun::Client;
use tiderun::ClientOptions;
use tiderun::DiscoveryClient;
use tiderun::Server;
use tiderun::ServerOptions;
use tiderun::balance::Strategy;
use tiderun::coord::KeyValueWatch;
use tiderun::coord::MemoryStore;
use tiderun::health::FixedHealth;
use tiderun::health::HealthMetric;
use tiderun::health::ProcStatHealth;
use tiderun::registration::LeaseRegistration;
use tiderun::registration::RegistrationConfig;
use tokio::net::TcpListener;
use tracing::Level;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
mod service;

use cli::Cli;
use cli::Commands;
use cli::EtcdArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
        EnvFilter::new(format!("tided={},tiderun={}", level, level))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { listen, read_timeout, write_timeout, cpu_sample, etcd, advertise } => {
            let advertise = advertise.unwrap_or_else(|| format!("tcp@{}", listen));
            handle_serve(listen, read_timeout, write_timeout, cpu_sample, &etcd, advertise).await
        }
        Commands::Call { addr, etcd, arg, codec, no_gzip, timeout_ms } => {
            let options = ClientOptions {
                serialization: codec.serialization(),
                compression: cli::compression(no_gzip),
                heartbeat: false,
                ..ClientOptions::default()
            };
            let timeout = Duration::from_millis(timeout_ms);
            if etcd.enabled() {
                handle_discovered_call(&etcd, arg, options, timeout).await
            } else {
                handle_call(&addr, arg, options, timeout).await
            }
        }
        Commands::Demo { servers, calls, random } => {
            let strategy = if random { Strategy::Random } else { Strategy::RoundRobin };
            handle_demo(servers.max(1), calls, strategy).await
        }
    }
}

#[cfg(feature = "etcd")]
async fn etcd_store(args: &EtcdArgs) -> anyhow::Result<Arc<dyn KeyValueWatch>> {
    let store = tiderun::etcd::EtcdStore::connect(&args.etcd).await?;
    info!(endpoints = ?args.etcd, "connected to etcd");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn etcd_store(_args: &EtcdArgs) -> anyhow::Result<Arc<dyn KeyValueWatch>> {
    anyhow::bail!("tided was built without etcd support; rebuild with `--features etcd`")
}

async fn handle_serve(
    listen: String,
    read_timeout: u64,
    write_timeout: u64,
    cpu_sample: Option<u64>,
    etcd: &EtcdArgs,
    advertise: String,
) -> anyhow::Result<()> {
    let health: Arc<dyn HealthMetric> = match cpu_sample {
        Some(secs) => Arc::new(ProcStatHealth::spawn(Duration::from_secs(secs.max(1)))),
        None => Arc::new(FixedHealth(0.0)),
    };
    let server = Server::new(ServerOptions {
        read_timeout: Duration::from_secs(read_timeout),
        write_timeout: Duration::from_secs(write_timeout),
        health,
        ..ServerOptions::default()
    });
    server.register(service::handler(listen.clone()));
    if etcd.enabled() {
        let mut config = RegistrationConfig::new(advertise);
        config.base_path = etcd.base_path.clone();
        info!(key = %config.key(), "registering in etcd");
        server.add_plugin(Arc::new(LeaseRegistration::new(etcd_store(etcd).await?, config)));
    }

    let serving = server.clone();
    let mut task = tokio::spawn(async move { serving.serve(&listen).await });
    tokio::select! {
        joined = &mut task => return Ok(joined??),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted, shutting down");
        }
    }

    server.shutdown().await;
    task.await??;
    Ok(())
}

async fn handle_call(addr: &str, arg: i64, options: ClientOptions, timeout: Duration) -> anyhow::Result<()> {
    let client = Client::connect(addr, options).await?;
    let mut ctx = CallContext::new().with_timeout(timeout);
    let result = client.call::<i64, i64>(&mut ctx, service::SERVICE, "Add", &arg).await;
    client.close().await;

    print_reply(arg, result?, ctx)
}

async fn handle_discovered_call(etcd: &EtcdArgs, arg: i64, options: ClientOptions, timeout: Duration) -> anyhow::Result<()> {
    let client = DiscoveryClient::new(etcd_store(etcd).await?, etcd.base_path.clone(), options).await?;
    info!(backends = ?client.backends(), "discovered backends");

    let mut ctx = CallContext::new().with_timeout(timeout);
    let result = client.call::<i64, i64>(&mut ctx, service::SERVICE, "Add", &arg).await;
    client.close().await?;
    print_reply(arg, result?, ctx)
}

fn print_reply(arg: i64, reply: i64, ctx: CallContext) -> anyhow::Result<()> {
    println!("{} + 1 = {}", arg, reply);
    let mut metadata: Vec<_> = ctx.response_metadata.into_iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        println!("  {} = {}", key, value);
    }
    Ok(())
}

async fn handle_demo(count: usize, calls: usize, strategy: Strategy) -> anyhow::Result<()> {
    let cluster = MemoryStore::new();

    let mut servers = Vec::with_capacity(count);
    for i in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("tcp@{}", listener.local_addr()?);
        let server = Server::new(ServerOptions::default());
        server.register(service::handler(format!("server-{}", i)));
        server.add_plugin(Arc::new(LeaseRegistration::new(
            Arc::new(cluster.connect()),
            RegistrationConfig::new(endpoint),
        )));

        let serving = server.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve_listener(listener).await {
                error!(error = %e, "server failed");
            }
        });
        servers.push(server);
    }

    let mut registered = 0;
    for _ in 0..100 {
        registered = cluster.scan_prefix(RegistrationConfig::DEFAULT_BASE_PATH).await?.len();
        if registered == count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::ensure!(registered == count, "only {} of {} servers registered", registered, count);

    let client = DiscoveryClient::new(
        Arc::new(cluster.connect()),
        RegistrationConfig::DEFAULT_BASE_PATH,
        ClientOptions { strategy, ..ClientOptions::default() },
    )
    .await?;
    info!(backends = ?client.backends(), "discovered backends");

    for i in 0..calls as i64 {
        let mut ctx = CallContext::new().with_timeout(Duration::from_secs(3));
        let reply: i64 = client.call(&mut ctx, service::SERVICE, "Add", &i).await?;
        let served_by = ctx.response_metadata.get("served-by").map(String::as_str).unwrap_or("?");
        println!("{} + 1 = {} (served by {})", i, reply, served_by);
    }

    client.close().await?;
    for server in servers {
        server.shutdown().await;
    }
    Ok(())
}

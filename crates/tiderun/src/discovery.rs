//! # Service Discovery
//!
//! A `DiscoveryClient` keeps one `Client` per backend registered under a
//! prefix and spreads calls across them with the configured balancer.
//!
//! ## Backend set
//!
//! Store keys (`base/tcp@host:port`) map to backend keys (the stored value).
//! Only the watch task writes the set, one event at a time and in order, and
//! it republishes the backend key list to the balancer after every change.
//! Calls read the set concurrently.
//!
//! ## Watch loss
//!
//! When the watch stream ends while the client is open, the watch is re-opened
//! with exponential backoff. Each time it is re-established the prefix is
//! rescanned and the set reconciled, since events may have been missed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use crate::balance::LoadBalancer;
use crate::client::Caller;
use crate::client::Client;
use crate::client::ClientOptions;
use crate::client::Error;
use crate::client::Result;
use crate::context::CallContext;
use crate::coord::KeyValueWatch;
use crate::coord::WatchEvent;
use crate::coord::WatchStream;

const WATCH_BACKOFF_MIN: Duration = Duration::from_millis(100);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(10);

pub struct DiscoveryClient {
    inner: Arc<Inner>,
    watcher: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn KeyValueWatch>,
    prefix: String,
    options: ClientOptions,
    balancer: Box<dyn LoadBalancer>,
    backends: RwLock<BackendSet>,
    closed: AtomicBool,
}

#[derive(Default)]
struct BackendSet {
    conns: HashMap<String, Arc<Backend>>,
    /// Backend keys in the order they were added.
    keys: Vec<String>,
    /// Store key to backend key.
    by_store_key: HashMap<String, String>,
}

struct Backend {
    key: String,
    client: ArcSwap<Client>,
    reconnect: tokio::sync::Mutex<()>,
}

impl DiscoveryClient {
    /// Seeds the backend set from a scan of `prefix` and starts watching it.
    pub async fn new(store: Arc<dyn KeyValueWatch>, prefix: impl Into<String>, options: ClientOptions) -> Result<Self> {
        let inner = Arc::new(Inner {
            store,
            prefix: prefix.into(),
            balancer: options.strategy.build(),
            options,
            backends: RwLock::new(BackendSet::default()),
            closed: AtomicBool::new(false),
        });

        // watch before scanning so nothing committed in between is missed
        let events = inner.store.watch_prefix(&inner.prefix).await?;
        inner.resync().await?;
        let watcher = tokio::spawn(watch_loop(inner.clone(), events));

        Ok(Self { inner, watcher })
    }

    /// Backend keys currently in the set.
    pub fn backends(&self) -> Vec<String> {
        self.inner.backends.read().keys.clone()
    }

    pub async fn call<A, R>(&self, ctx: &mut CallContext, path: &str, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.inner.pick().await?;
        client.call(ctx, path, method, arg).await
    }

    pub async fn async_call<A, R>(&self, ctx: &CallContext, path: &str, method: &str, arg: &A) -> Caller<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match self.inner.pick().await {
            Ok(client) => client.async_call(ctx, path, method, arg).await,
            Err(e) => Caller::failed(path, method, e),
        }
    }

    /// Stops watching, closes every backend connection and the store session.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.watcher.abort();

        let backends: Vec<_> = {
            let mut set = self.inner.backends.write();
            set.keys.clear();
            set.by_store_key.clear();
            self.inner.balancer.update_addrs(Vec::new());
            set.conns.drain().map(|(_, b)| b).collect()
        };
        for backend in backends {
            backend.client.load_full().close().await;
        }
        self.inner.store.close().await?;
        Ok(())
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl Inner {
    /// Picks a backend and makes sure its connection is usable, reconnecting
    /// through the breaker if it was closed.
    async fn pick(&self) -> Result<Arc<Client>> {
        if self.backends.read().conns.is_empty() {
            return Err(Error::NoBackend);
        }
        let breaker = &self.options.breaker;
        if !breaker.ready() {
            return Err(Error::BreakerOpen);
        }
        let key = self.balancer.get().ok_or(Error::NoBackend)?;
        let backend = self.backends.read().conns.get(&key).cloned().ok_or(Error::NoBackend)?;

        let client = backend.client.load_full();
        if !client.is_closed() {
            return Ok(client);
        }

        let _guard = backend.reconnect.lock().await;
        let client = backend.client.load_full();
        if !client.is_closed() {
            return Ok(client);
        }
        match Client::connect(&backend.key, self.options.clone()).await {
            Ok(fresh) => {
                breaker.success();
                let fresh = Arc::new(fresh);
                backend.client.store(fresh.clone());
                info!(backend = %backend.key, "reconnected backend");
                Ok(fresh)
            }
            Err(e) => {
                breaker.fail();
                Err(e)
            }
        }
    }

    async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put { key, value } => self.add(key, value).await,
            WatchEvent::Delete { key } => self.remove(&key).await,
        }
    }

    async fn add(&self, store_key: String, backend_key: String) {
        let (known, moved) = {
            let set = self.backends.read();
            match set.by_store_key.get(&store_key) {
                Some(current) if *current == backend_key => return,
                current => (set.conns.contains_key(&backend_key), current.is_some()),
            }
        };
        // a store key now pointing somewhere else drops its old backend first
        if moved {
            self.remove(&store_key).await;
        }

        if known {
            self.backends.write().by_store_key.insert(store_key, backend_key);
            return;
        }

        let client = match Client::connect(&backend_key, self.options.clone()).await {
            Ok(client) => client,
            Err(e) => {
                warn!(backend = %backend_key, error = %e, "server connect failed");
                return;
            }
        };

        let mut set = self.backends.write();
        set.conns.insert(backend_key.clone(), Arc::new(Backend {
            key: backend_key.clone(),
            client: ArcSwap::from_pointee(client),
            reconnect: tokio::sync::Mutex::new(()),
        }));
        set.keys.push(backend_key.clone());
        set.by_store_key.insert(store_key, backend_key.clone());
        self.balancer.update_addrs(set.keys.clone());
        info!(backend = %backend_key, "backend added");
    }

    async fn remove(&self, store_key: &str) {
        let removed = {
            let mut set = self.backends.write();
            let Some(backend_key) = set.by_store_key.remove(store_key) else { return };
            if set.by_store_key.values().any(|v| *v == backend_key) {
                return;
            }
            set.keys.retain(|k| *k != backend_key);
            self.balancer.update_addrs(set.keys.clone());
            set.conns.remove(&backend_key)
        };
        if let Some(backend) = removed {
            info!(backend = %backend.key, "backend removed");
            backend.client.load_full().close().await;
        }
    }

    /// Reconciles the set with a fresh scan of the prefix.
    async fn resync(&self) -> Result<()> {
        let pairs: HashMap<String, String> = self.store.scan_prefix(&self.prefix).await?.into_iter().collect();
        let stale: Vec<String> = self
            .backends
            .read()
            .by_store_key
            .keys()
            .filter(|k| !pairs.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            self.remove(&key).await;
        }
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort();
        for (key, value) in pairs {
            self.add(key, value).await;
        }
        Ok(())
    }
}

async fn watch_loop(inner: Arc<Inner>, mut events: WatchStream) {
    loop {
        while let Some(event) = events.recv().await {
            inner.apply(event).await;
        }
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(prefix = %inner.prefix, "watch stream lost");

        let mut backoff = WATCH_BACKOFF_MIN;
        events = loop {
            tokio::time::sleep(backoff).await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match inner.store.watch_prefix(&inner.prefix).await {
                Ok(stream) => match inner.resync().await {
                    Ok(()) => break stream,
                    Err(e) => warn!(prefix = %inner.prefix, error = %e, "rescan after watch loss failed"),
                },
                Err(e) => warn!(prefix = %inner.prefix, error = %e, "re-watch failed"),
            }
            backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
        };
        info!(prefix = %inner.prefix, "watch re-established");
    }
}

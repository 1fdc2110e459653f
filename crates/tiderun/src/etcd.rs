//! # etcd Coordination Store
//!
//! `KeyValueWatch` over an etcd v3 cluster through `etcd-client`, so servers
//! in different processes register with and discover each other. Built with
//! the `etcd` feature.
//!
//! One `EtcdStore` is one session: `close` ends the watches and keep-alives it
//! started and leaves the cluster and other sessions alone.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use etcd_client::Client;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::PutOptions;
use etcd_client::WatchOptions;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::coord::Error;
use crate::coord::KeepAliveStream;
use crate::coord::KeyValueWatch;
use crate::coord::LeaseId;
use crate::coord::Result;
use crate::coord::WatchEvent;
use crate::coord::WatchStream;

/// Shortest pause between lease renewals.
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(500);

pub struct EtcdStore {
    client: Client,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EtcdStore {
    /// Connects to the cluster at `endpoints` (`http://host:port`).
    pub async fn connect<E: AsRef<str>>(endpoints: &[E]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(backend)?;
        Ok(Self {
            client,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A handle for one request. Clones share the underlying channel.
    fn client(&self) -> Result<Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self.client.clone())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

fn backend(e: etcd_client::Error) -> Error {
    Error::Backend(e.to_string())
}

#[async_trait::async_trait]
impl KeyValueWatch for EtcdStore {
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let resp = self
            .client()?
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        let pairs = resp
            .kvs()
            .iter()
            .filter_map(|kv| Some((kv.key_str().ok()?.to_owned(), kv.value_str().ok()?.to_owned())))
            .collect();
        Ok(pairs)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (watcher, mut stream) = self
            .client()?
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_owned();

        self.track(tokio::spawn(async move {
            // the watch lives as long as its watcher handle
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "etcd watch failed");
                        break;
                    }
                };
                if resp.canceled() {
                    debug!(prefix = %prefix, "etcd watch canceled");
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let event = match event.event_type() {
                        EventType::Put => WatchEvent::Put {
                            key: key.to_owned(),
                            value: kv.value_str().unwrap_or_default().to_owned(),
                        },
                        EventType::Delete => WatchEvent::Delete { key: key.to_owned() },
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        }));
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(Error::Backend("lease ttl must be positive".into()));
        }
        // etcd counts leases in whole seconds
        let secs = ttl.as_secs().max(1) as i64;
        let resp = self.client()?.lease_grant(secs, None).await.map_err(backend)?;
        Ok(resp.id())
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        self.client()?
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (mut keeper, mut acks) = self.client()?.lease_keep_alive(lease).await.map_err(backend)?;

        // first renewal inline so an unknown lease is reported to the caller
        keeper.keep_alive().await.map_err(backend)?;
        let first = acks.message().await.map_err(backend)?.ok_or(Error::Closed)?;
        if first.ttl() <= 0 {
            return Err(Error::LeaseNotFound(lease));
        }

        // capacity 1: an undrained stream stalls renewal after one buffered ack
        let (tx, rx) = mpsc::channel(1);
        self.track(tokio::spawn(async move {
            let mut ttl = first.ttl();
            loop {
                if tx.send(lease).await.is_err() {
                    return;
                }
                let period = Duration::from_secs(ttl as u64) / 3;
                tokio::time::sleep(period.max(MIN_RENEW_PERIOD)).await;

                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease, error = %e, "etcd keep-alive failed");
                    return;
                }
                ttl = match acks.message().await {
                    Ok(Some(ack)) if ack.ttl() > 0 => ack.ttl(),
                    Ok(Some(_)) => {
                        debug!(lease, "lease expired");
                        return;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(lease, error = %e, "etcd keep-alive failed");
                        return;
                    }
                };
            }
        }));
        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.client()?.lease_revoke(lease).await.map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for EtcdStore {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// etcd reports a missing lease only in the status message.
fn lease_error(e: etcd_client::Error, lease: LeaseId) -> Error {
    let msg = e.to_string();
    if msg.contains("lease not found") {
        Error::LeaseNotFound(lease)
    } else {
        Error::Backend(msg)
    }
}

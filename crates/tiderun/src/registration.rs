//! # Server Registration
//!
//! A server announces itself by writing `base_path/server_addr -> server_addr`
//! under a lease and renewing that lease for as long as it lives. If the
//! process dies the renewals stop, the lease lapses and the key disappears;
//! that is the only way clients learn a server is gone without a clean
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::coord::KeyValueWatch;
use crate::coord::LeaseId;

/// A server lifecycle hook. `register` runs before the first accept and a
/// failure aborts startup; `close` runs on shutdown.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    async fn register(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub base_path: String,
    pub lease_ttl: Duration,
    /// Backend key clients will dial, `network@host:port`.
    pub server_addr: String,
}

impl RegistrationConfig {
    pub const DEFAULT_BASE_PATH: &'static str = "/tide/services";
    pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            base_path: Self::DEFAULT_BASE_PATH.to_owned(),
            lease_ttl: Self::DEFAULT_LEASE_TTL,
            server_addr: server_addr.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.base_path.trim_end_matches('/'), self.server_addr)
    }
}

/// Registers the server under a renewed lease.
pub struct LeaseRegistration {
    store: Arc<dyn KeyValueWatch>,
    config: RegistrationConfig,
    active: Mutex<Option<Active>>,
}

struct Active {
    lease: LeaseId,
    drain: JoinHandle<()>,
}

impl LeaseRegistration {
    pub fn new(store: Arc<dyn KeyValueWatch>, mut config: RegistrationConfig) -> Self {
        if config.base_path.is_empty() {
            config.base_path = RegistrationConfig::DEFAULT_BASE_PATH.to_owned();
        }
        if config.lease_ttl.is_zero() {
            config.lease_ttl = RegistrationConfig::DEFAULT_LEASE_TTL;
        }
        Self { store, config, active: Mutex::new(None) }
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn lease(&self) -> Option<LeaseId> {
        self.active.lock().as_ref().map(|a| a.lease)
    }
}

#[async_trait::async_trait]
impl Plugin for LeaseRegistration {
    async fn register(&self) -> anyhow::Result<()> {
        let key = self.config.key();
        let lease = self.store.grant_lease(self.config.lease_ttl).await?;
        self.store.put_with_lease(&key, &self.config.server_addr, lease).await?;
        let mut acks = self.store.keep_alive(lease).await?;

        let drain = tokio::spawn(async move {
            while let Some(id) = acks.recv().await {
                debug!(lease = id, "lease renewed");
            }
            warn!(lease, "lease keep-alive stream ended");
        });

        info!(key = %key, lease, ttl = ?self.config.lease_ttl, "registered server");
        if let Some(old) = self.active.lock().replace(Active { lease, drain }) {
            old.drain.abort();
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.drain.abort();
            self.store.revoke_lease(active.lease).await?;
        }
        self.store.close().await?;
        Ok(())
    }
}

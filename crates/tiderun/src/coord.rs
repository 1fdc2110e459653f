//! # Coordination Store
//!
//! The slice of an etcd-style key-value store that registration and discovery
//! need: prefix scans, prefix watches, and leases that delete their keys when
//! they are not renewed.
//!
//! `MemoryStore` implements the capability in process. Every handle returned
//! by `MemoryStore::connect` shares the same data but owns its own session, so
//! closing one handle ends only that handle's watches and keep-alives, the way
//! closing one etcd client leaves the cluster running.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Events for one prefix, in commit order. The stream ends when the watch is
/// lost or the session is closed.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// One item per successful renewal. The lease is renewed only while this
/// stream is being drained.
pub type KeepAliveStream = mpsc::Receiver<LeaseId>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The session was closed.
    Closed,
    LeaseNotFound(LeaseId),
    /// The backend refused or failed the request.
    Backend(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "coordination session closed"),
            Self::LeaseNotFound(id) => write!(f, "lease {} not found", id),
            Self::Backend(msg) => write!(f, "coordination backend error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Prefix scan, prefix watch and lease operations of a coordination backend.
#[async_trait::async_trait]
pub trait KeyValueWatch: Send + Sync + 'static {
    /// All pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Changes under `prefix` from now on.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Writes `key` bound to `lease`; the key is deleted when the lease ends.
    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Starts renewing `lease` for as long as the returned stream is drained.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Ends `lease` now, deleting its keys.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Ends this session's watches and keep-alives.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
//  IN-MEMORY STORE
// ============================================================================

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<State>>,
    session: Arc<Session>,
}

struct Session {
    id: u64,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
    next_lease: LeaseId,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    session: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(State::default())),
            session: new_session(),
        }
    }

    /// A new session over the same data.
    pub fn connect(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            session: new_session(),
        }
    }

    /// Writes a key with no lease.
    pub fn put(&self, key: &str, value: &str) {
        self.shared.lock().put(key, value, None);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.shared.lock().delete(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Ends every watch stream of this session without closing it, as if the
    /// connection to the backend dropped.
    pub fn drop_watches(&self) {
        let id = self.session.id;
        self.shared.lock().watchers.retain(|w| w.session != id);
    }

    fn check_open(&self) -> Result<()> {
        if self.session.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Deletes the lease's keys once its deadline passes without renewal.
    fn spawn_expiry(&self, lease: LeaseId) {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                let expires = {
                    let Some(shared) = shared.upgrade() else { return };
                    let mut state = shared.lock();
                    let expires = match state.leases.get(&lease) {
                        Some(l) => l.expires,
                        None => return,
                    };
                    if expires <= Instant::now() {
                        state.end_lease(lease);
                        debug!(lease, "lease expired");
                        return;
                    }
                    expires
                };
                tokio::time::sleep_until(expires).await;
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_session() -> Arc<Session> {
    Arc::new(Session {
        id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        closed: AtomicBool::new(false),
    })
}

impl State {
    fn put(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        let previous = self.entries.insert(key.to_owned(), Entry { value: value.to_owned(), lease });
        if let Some(old) = previous.and_then(|e| e.lease) {
            if Some(old) != lease {
                if let Some(l) = self.leases.get_mut(&old) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.insert(key.to_owned());
        }
        self.emit(WatchEvent::Put { key: key.to_owned(), value: value.to_owned() });
    }

    fn delete(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else { return false };
        if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.remove(key);
        }
        self.emit(WatchEvent::Delete { key: key.to_owned() });
        true
    }

    fn end_lease(&mut self, lease: LeaseId) -> bool {
        let Some(l) = self.leases.remove(&lease) else { return false };
        let mut keys: Vec<_> = l.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete(&key);
        }
        true
    }

    fn emit(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if !event.key().starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(event.clone()).is_ok()
        });
    }
}

#[async_trait::async_trait]
impl KeyValueWatch for MemoryStore {
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check_open()?;
        let state = self.shared.lock();
        let pairs = state
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        Ok(pairs)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().watchers.push(Watcher {
            session: self.session.id,
            prefix: prefix.to_owned(),
            tx,
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_open()?;
        if ttl.is_zero() {
            return Err(Error::Backend("lease ttl must be positive".into()));
        }
        let id = {
            let mut state = self.shared.lock();
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(id, Lease {
                ttl,
                expires: Instant::now() + ttl,
                keys: HashSet::new(),
            });
            id
        };
        self.spawn_expiry(id);
        Ok(id)
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        self.check_open()?;
        let mut state = self.shared.lock();
        if !state.leases.contains_key(&lease) {
            return Err(Error::LeaseNotFound(lease));
        }
        state.put(key, value, Some(lease));
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.check_open()?;
        let ttl = self
            .shared
            .lock()
            .leases
            .get(&lease)
            .map(|l| l.ttl)
            .ok_or(Error::LeaseNotFound(lease))?;

        // capacity 1: an undrained stream stalls renewal after one buffered ack
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::downgrade(&self.shared);
        let session = self.session.clone();
        let period = (ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if session.closed.load(Ordering::Acquire) {
                    return;
                }
                let renewed = {
                    let Some(shared) = shared.upgrade() else { return };
                    let mut state = shared.lock();
                    match state.leases.get_mut(&lease) {
                        Some(l) => {
                            l.expires = Instant::now() + l.ttl;
                            true
                        }
                        None => false,
                    }
                };
                if !renewed || tx.send(lease).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check_open()?;
        if self.shared.lock().end_lease(lease) {
            Ok(())
        } else {
            Err(Error::LeaseNotFound(lease))
        }
    }

    async fn close(&self) -> Result<()> {
        self.session.closed.store(true, Ordering::Release);
        self.drop_watches();
        Ok(())
    }
}

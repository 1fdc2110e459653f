//! # Load Balancing
//!
//! Selection over the live backend key list. Discovery publishes the list with
//! `update_addrs` under its writer lock; callers read with `get` and no lock.
//! A returned key may already be gone by the time it is used, so callers
//! re-validate it against their backend set.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwap;
use rand::Rng;

/// Picks one backend key from the current list.
pub trait LoadBalancer: Send + Sync {
    /// Returns `None` when there is nothing to pick from.
    fn get(&self) -> Option<String>;
    /// Replaces the address list.
    fn update_addrs(&self, addrs: Vec<String>);
}

/// Built-in balancer selector for `ClientOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
}

impl Strategy {
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::Random => Box::new(RandomBalancer::default()),
        }
    }
}

/// Cycles through the list in order. Updating the list keeps the cursor; it
/// is reduced modulo the new length on the next pick.
#[derive(Default)]
pub struct RoundRobin {
    addrs: ArcSwap<Vec<String>>,
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn get(&self) -> Option<String> {
        let addrs = self.addrs.load();
        if addrs.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % addrs.len();
        Some(addrs[i].clone())
    }

    fn update_addrs(&self, addrs: Vec<String>) {
        self.addrs.store(Arc::new(addrs));
    }
}

/// Uniform pick on every call.
#[derive(Default)]
pub struct RandomBalancer {
    addrs: ArcSwap<Vec<String>>,
}

impl LoadBalancer for RandomBalancer {
    fn get(&self) -> Option<String> {
        let addrs = self.addrs.load();
        if addrs.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..addrs.len());
        Some(addrs[i].clone())
    }

    fn update_addrs(&self, addrs: Vec<String>) {
        self.addrs.store(Arc::new(addrs));
    }
}

//! # Object Pool
//!
//! A bounded free list of reusable values. The pool owns idle entries; a
//! `Pooled` guard owns a checked-out entry until it is released, explicitly or
//! by drop. Entries are reset on release, so an acquirer never sees state left
//! behind by a previous owner.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use parking_lot::Mutex;

pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
    make: fn() -> T,
    reset: fn(&mut T),
}

impl<T> Pool<T> {
    /// Creates a pool retaining at most `capacity` idle entries.
    pub fn new(capacity: usize, make: fn() -> T, reset: fn(&mut T)) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            make,
            reset,
        })
    }

    /// Checks out an entry, reusing an idle one when available.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let value = self.idle.lock().pop().unwrap_or_else(self.make);
        Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle entries waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn put(&self, mut value: T) {
        (self.reset)(&mut value);
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(value);
        }
    }
}

impl<T: Default> Pool<T> {
    /// A pool whose entries are made and reset through `Default`.
    pub fn with_default(capacity: usize) -> Arc<Self> {
        Self::new(capacity, T::default, |v| *v = T::default())
    }
}

/// An entry checked out of a `Pool`.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T> Pooled<T> {
    /// Returns the entry to its pool.
    pub fn release(self) {
        drop(self)
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_resets_before_reuse() {
        let pool: Arc<Pool<Vec<u8>>> = Pool::new(4, Vec::new, Vec::clear);

        let mut a = pool.acquire();
        a.extend_from_slice(b"stale");
        let cap = a.capacity();
        a.release();
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire();
        assert!(b.is_empty());
        assert_eq!(b.capacity(), cap);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_idle_is_bounded() {
        let pool: Arc<Pool<u32>> = Pool::with_default(2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_with_default_resets_value() {
        let pool: Arc<Pool<i64>> = Pool::with_default(1);
        let mut v = pool.acquire();
        *v = 42;
        drop(v);
        assert_eq!(*pool.acquire(), 0);
    }
}

//! Pool of session ports
//!
//! Each admitted client gets its own UDP port. Ports are leased with a
//! non-blocking [`PortPool::acquire`] and handed back with
//! [`PortPool::release`] once the session's socket is closed.

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// Thread-safe FIFO of free ports
#[derive(Debug)]
pub struct PortPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    free: VecDeque<u16>,
    free_set: FxHashSet<u16>,
    members: FxHashSet<u16>,
}

impl PortPool {
    /// Pool holding every port in `range`
    pub fn from_range(range: RangeInclusive<u16>) -> Self {
        Self::from_ports(range)
    }

    /// Pool holding the given ports, in order
    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut inner = PoolInner::default();
        for port in ports {
            if inner.members.insert(port) {
                inner.free.push_back(port);
                inner.free_set.insert(port);
            }
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Take the next free port, or `None` if every port is leased
    pub fn acquire(&self) -> Option<u16> {
        let mut inner = self.inner.lock();
        let port = inner.free.pop_front()?;
        inner.free_set.remove(&port);
        Some(port)
    }

    /// Return a leased port.
    ///
    /// Releasing a port that is already free, or that never belonged to the
    /// pool, is ignored.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock();
        if !inner.members.contains(&port) {
            tracing::warn!("Ignoring release of port {} outside the pool", port);
            return;
        }
        if inner.free_set.insert(port) {
            inner.free.push_back(port);
        }
    }

    /// Number of free ports
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Total ports managed by the pool
    pub fn capacity(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_free(&self, port: u16) -> bool {
        self.inner.lock().free_set.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = PortPool::from_range(5000..=5002);

        assert_eq!(pool.acquire(), Some(5000));
        assert_eq!(pool.acquire(), Some(5001));
        assert_eq!(pool.acquire(), Some(5002));
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let pool = PortPool::from_range(5000..=5000);
        let port = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), None);

        pool.release(port);
        assert!(pool.is_free(port));
        assert_eq!(pool.acquire(), Some(port));
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = PortPool::from_range(5000..=5001);
        let port = pool.acquire().unwrap();

        pool.release(port);
        pool.release(port);
        pool.release(9999);

        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_released_ports_go_to_the_back() {
        let pool = PortPool::from_range(5000..=5002);
        let first = pool.acquire().unwrap();
        pool.release(first);

        assert_eq!(pool.acquire(), Some(5001));
        assert_eq!(pool.acquire(), Some(5002));
        assert_eq!(pool.acquire(), Some(5000));
    }

    #[test]
    fn test_concurrent_acquire_hands_out_distinct_ports() {
        let pool = Arc::new(PortPool::from_range(6000..=6099));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut ports = Vec::new();
                    while let Some(port) = pool.acquire() {
                        ports.push(port);
                    }
                    ports
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 100);
    }
}

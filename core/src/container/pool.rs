//! Fixed-size instance arena.
//!
//! Slots are allocated once at creation and indexed `0..N`. A free list and
//! a per-slot status vector track which slots may be handed out; a condition
//! variable wakes callers blocked on an empty free list.

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use crate::error::{ContainerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Free,
    Busy,
    Retired,
}

struct PoolState {
    status: Vec<SlotStatus>,
    free: Vec<usize>,
    retired: usize,
    completed: u64,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub busy: usize,
    pub retired: usize,
    /// Leases returned so far, retired or not.
    pub completed: u64,
}

pub struct InstancePool<T> {
    slots: Vec<Mutex<T>>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl<T> InstancePool<T> {
    pub fn new(items: Vec<T>) -> Self {
        let n = items.len();
        Self {
            slots: items.into_iter().map(Mutex::new).collect(),
            state: Mutex::new(PoolState {
                status: vec![SlotStatus::Free; n],
                // Reversed so that slot 0 is handed out first.
                free: (0..n).rev().collect(),
                retired: 0,
                completed: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Take exclusive use of a free slot, blocking until one is released.
    ///
    /// Fails only when every slot has been retired.
    pub fn acquire(&self) -> Result<Lease<'_, T>> {
        self.acquire_until(None)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<'_, T>> {
        self.acquire_until(Some((Instant::now() + timeout, timeout)))
    }

    fn acquire_until(&self, deadline: Option<(Instant, Duration)>) -> Result<Lease<'_, T>> {
        let mut state = self.state.lock();
        let index = loop {
            if let Some(index) = state.free.pop() {
                state.status[index] = SlotStatus::Busy;
                break index;
            }
            if state.retired == self.slots.len() {
                return Err(ContainerError::Exhausted(self.slots.len()));
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some((at, timeout)) => {
                    if Instant::now() >= at {
                        return Err(ContainerError::Timeout(timeout));
                    }
                    self.available.wait_until(&mut state, at);
                }
            }
        };
        drop(state);

        // Status guarantees nobody else holds this slot, so this never blocks.
        let guard = self.slots[index].lock();
        Ok(Lease {
            pool: self,
            index,
            guard: Some(guard),
            retire: false,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let busy = state
            .status
            .iter()
            .filter(|s| **s == SlotStatus::Busy)
            .count();
        PoolStats {
            total: self.slots.len(),
            free: state.free.len(),
            busy,
            retired: state.retired,
            completed: state.completed,
        }
    }

    /// Number of slots currently leased out.
    pub fn in_flight(&self) -> usize {
        self.stats().busy
    }

    fn give_back(&self, index: usize, retire: bool) {
        let mut state = self.state.lock();
        state.completed += 1;
        if retire {
            state.status[index] = SlotStatus::Retired;
            state.retired += 1;
            drop(state);
            // Waiters must re-check whether any slot is still usable.
            self.available.notify_all();
        } else {
            state.status[index] = SlotStatus::Free;
            state.free.push(index);
            drop(state);
            self.available.notify_one();
        }
    }
}

/// Exclusive use of one pool slot. Returned to the free list on drop, or
/// retired if [`Lease::retire`] was called or the thread is panicking.
pub struct Lease<'a, T> {
    pool: &'a InstancePool<T>,
    index: usize,
    guard: Option<MutexGuard<'a, T>>,
    retire: bool,
}

impl<T> Lease<'_, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Exclude this slot from all future dispatch.
    pub fn retire(mut self) {
        self.retire = true;
    }
}

impl<T> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("lease guard is only taken in drop"),
        }
    }
}

impl<T> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("lease guard is only taken in drop"),
        }
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let retire = self.retire || std::thread::panicking();
        self.pool.give_back(self.index, retire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let pool = InstancePool::new(vec![10, 20]);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(*a + *b, 30);
        assert_eq!(pool.stats().busy, 2);
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!((stats.free, stats.busy, stats.completed), (2, 0, 2));
    }

    #[test]
    fn test_lease_mutation_persists() {
        let pool = InstancePool::new(vec![0u32]);
        {
            let mut lease = pool.acquire().unwrap();
            *lease += 5;
        }
        assert_eq!(*pool.acquire().unwrap(), 5);
    }

    #[test]
    fn test_blocks_until_release() {
        let pool = Arc::new(InstancePool::new(vec![()]));
        let lease = pool.acquire().unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pool = Arc::clone(&pool);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lease = pool.acquire().unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(lease);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timeout() {
        let pool = InstancePool::new(vec![()]);
        let _held = pool.acquire().unwrap();
        let err = pool.acquire_timeout(Duration::from_millis(20)).err().unwrap();
        assert!(matches!(err, ContainerError::Timeout(_)));
    }

    #[test]
    fn test_retired_slot_never_returns() {
        let pool = InstancePool::new(vec![1, 2]);
        let first = pool.acquire().unwrap();
        let retired_index = first.index();
        first.retire();

        for _ in 0..4 {
            let lease = pool.acquire().unwrap();
            assert_ne!(lease.index(), retired_index);
        }
        assert_eq!(pool.stats().retired, 1);
    }

    #[test]
    fn test_exhausted_wakes_waiters() {
        let pool = Arc::new(InstancePool::new(vec![()]));
        let lease = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|_| ()))
        };

        thread::sleep(Duration::from_millis(20));
        lease.retire();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ContainerError::Exhausted(1))));
        assert!(matches!(pool.acquire(), Err(ContainerError::Exhausted(1))));
    }
}

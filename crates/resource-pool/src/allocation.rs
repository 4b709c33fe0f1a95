//! Allocation handle: a grant of units that are returned to the pool piecewise.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pool::PoolShared;

struct AllocationInner {
    size: usize,
    remaining: AtomicUsize,
    pool: Arc<PoolShared>,
}

impl Drop for AllocationInner {
    fn drop(&mut self) {
        let remaining = *self.remaining.get_mut();
        if remaining > 0 {
            tracing::trace!(pool = %self.pool.name(), remaining, "Allocation dropped - returning units");
            self.pool.release(remaining);
        }
    }
}

/// Units granted by a [`Pool`](crate::Pool).
///
/// Clones share the same grant: units released through one clone are gone for
/// all of them, and the grant as a whole can never return more units than it
/// was given. Units still held when the last clone is dropped go back to the pool.
#[derive(Clone)]
pub struct Allocation {
    inner: Arc<AllocationInner>,
}

impl Allocation {
    pub(crate) fn new(pool: Arc<PoolShared>, size: usize) -> Self {
        Self {
            inner: Arc::new(AllocationInner {
                size,
                remaining: AtomicUsize::new(size),
                pool,
            }),
        }
    }

    /// Units originally granted.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Units not yet released.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    pub fn release_one(&self) {
        self.release(1);
    }

    /// Release every unit still held. A no-op once nothing is held.
    pub fn release_all(&self) {
        self.release(usize::MAX);
    }

    /// Release up to `count` units, clamped to what is still held.
    pub fn release(&self, count: usize) {
        let taken = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                (remaining > 0 && count > 0).then(|| remaining - count.min(remaining))
            });

        if let Ok(before) = taken {
            self.inner.pool.release(count.min(before));
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("size", &self.size())
            .field("remaining", &self.remaining())
            .finish()
    }
}

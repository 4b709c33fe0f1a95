//! Pool: the public handle over the shared pool state.
//!
//! All state transitions run under one mutex. Grants are fulfilled before the
//! lock is released, so a synchronous read that follows a transition always
//! sees its outcome. Allocations whose requester has gone away are dropped
//! (returning their units) only after the lock is released, and the idle
//! signal is fired last.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::allocation::Allocation;
use crate::config::{Capacity, PoolConfig};
use crate::idle::WhenIdle;
use crate::request::{AllocationRequest, ForceResolver, PartialAllocationRequest};
use crate::state::{Admission, Demand, Grant, PoolState, Transition, WaiterId};

type Notifier = oneshot::Sender<Allocation>;

pub(crate) struct PoolShared {
    name: String,
    state: Mutex<PoolState<Notifier>>,
}

impl PoolShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Lock the state. On poison, log and keep going: every transition
    /// finishes its bookkeeping before any code that could panic runs.
    fn lock(&self) -> MutexGuard<'_, PoolState<Notifier>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(pool = %self.name, "Pool mutex poisoned - recovering state");
            poisoned.into_inner()
        })
    }

    pub(crate) fn release(self: &Arc<Self>, units: usize) {
        self.apply(|state| state.release(units));
    }

    pub(crate) fn force(self: &Arc<Self>, waiter: WaiterId) {
        self.apply(|state| state.force(waiter));
    }

    /// Run one transition and deliver its effects.
    fn apply<F>(self: &Arc<Self>, transition: F)
    where
        F: FnOnce(&mut PoolState<Notifier>) -> Transition<Notifier>,
    {
        let mut undelivered = Vec::new();
        let idle = {
            let mut state = self.lock();
            let Transition { grants, idle } = transition(&mut *state);
            for Grant { notifier, units } in grants {
                if let Err(allocation) = notifier.send(Allocation::new(Arc::clone(self), units)) {
                    undelivered.push(allocation);
                }
            }
            idle
        };

        if !undelivered.is_empty() {
            tracing::debug!(
                pool = %self.name,
                count = undelivered.len(),
                "Requesters gone before grant - returning units"
            );
        }
        drop(undelivered);

        if let Some(idle) = idle {
            idle.fire();
        }
    }
}

/// A counting resource pool.
///
/// Requests for units are granted immediately when they fit, and otherwise wait
/// in arrival order until released units (or a larger size) make room. Cloning
/// a `Pool` yields another handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::with_config(PoolConfig::default())
    }
}

impl Pool {
    /// A pool of `size` units.
    pub fn new(size: usize) -> Self {
        Self::with_config(PoolConfig::bounded(size))
    }

    pub fn unbounded() -> Self {
        Self::with_config(PoolConfig::unbounded())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        tracing::debug!(pool = %config.name, size = %config.size, "Pool created");
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::new(config.name.clone(), config.size)),
                name: config.name,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Request a single unit.
    pub fn allocate_one(&self) -> PartialAllocationRequest {
        self.allocate(1)
    }

    /// Request `count` units.
    ///
    /// The request can be forced if it has to wait, see
    /// [`PartialAllocationRequest::force`].
    pub fn allocate(&self, count: usize) -> PartialAllocationRequest {
        let (receiver, waiter) = self.request(Demand::Units(count));
        let resolver = waiter.map(|waiter| ForceResolver::new(Arc::clone(&self.shared), waiter));
        PartialAllocationRequest::new(AllocationRequest::new(receiver), resolver)
    }

    /// Request every unit of the pool.
    ///
    /// Granted once nothing is allocated, with the size the pool has at that
    /// moment. Never granted while the pool is unbounded or has size zero.
    pub fn allocate_all(&self) -> AllocationRequest {
        let (receiver, _) = self.request(Demand::All);
        AllocationRequest::new(receiver)
    }

    fn request(&self, demand: Demand) -> (oneshot::Receiver<Allocation>, Option<WaiterId>) {
        let (notifier, receiver) = oneshot::channel();
        let mut queued = None;
        self.shared.apply(|state| match state.request(demand, notifier) {
            Admission::Granted(grant) => Transition::granted(grant),
            Admission::Queued(waiter) => {
                queued = Some(waiter);
                Transition::none()
            }
        });
        (receiver, queued)
    }

    /// Change the number of units in the pool.
    ///
    /// Growing the pool grants waiters that now fit. Shrinking it never takes
    /// back units already granted.
    pub fn set_size(&self, size: usize) {
        self.set_capacity(Capacity::Bounded(size));
    }

    /// Like [`set_size`](Self::set_size), also allowing an unbounded pool.
    pub fn set_capacity(&self, capacity: Capacity) {
        self.shared.apply(|state| state.set_size(capacity));
    }

    pub fn size(&self) -> Capacity {
        self.shared.lock().size()
    }

    /// Units not currently allocated, zero while usage bursts above the size.
    pub fn availability(&self) -> Capacity {
        self.shared.lock().availability()
    }

    /// Units currently allocated, including any burst above the size.
    pub fn usage(&self) -> usize {
        self.shared.lock().usage()
    }

    /// Requests waiting for units.
    pub fn queued(&self) -> usize {
        self.shared.lock().queued()
    }

    /// Completes when the pool next has nothing allocated and nobody waiting.
    ///
    /// Already complete if that is the case right now. To run a handler on
    /// idle, map the returned future (`futures::FutureExt::map`).
    pub fn when_idle(&self) -> WhenIdle {
        self.shared.lock().when_idle()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("size", &state.size())
            .field("usage", &state.usage())
            .field("queued", &state.queued())
            .finish()
    }
}

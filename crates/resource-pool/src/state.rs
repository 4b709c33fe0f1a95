//! Pool state machine: capacity, usage, the FIFO waiter queue and idle detection.
//!
//! `PoolState` holds no locks and delivers nothing itself. Every mutating call
//! returns the effects it produced (grants to deliver, idle trigger to fire) and
//! the owner delivers them. Anything a delivery sets off, such as units coming
//! straight back from a requester that is gone, runs as a separate complete
//! transition, never inside a drain in progress.
//!
//! The notifier type `N` is opaque here: the pool uses oneshot senders, tests
//! use plain markers.

use std::collections::VecDeque;
use std::fmt;

use crate::config::Capacity;
use crate::idle::{IdleSignal, IdleTrigger, WhenIdle};

/// How many units a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demand {
    Units(usize),
    /// The whole declared size, measured when granted. Only granted to an
    /// unused pool with a positive bounded size.
    All,
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Units(n) => write!(f, "{n}"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Identifies a queued waiter for forced admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(u64);

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Waiter<N> {
    id: WaiterId,
    demand: Demand,
    notifier: N,
}

/// Units granted to a requester, to be delivered through its notifier.
#[derive(Debug)]
pub(crate) struct Grant<N> {
    pub(crate) notifier: N,
    pub(crate) units: usize,
}

#[derive(Debug)]
pub(crate) enum Admission<N> {
    Granted(Grant<N>),
    Queued(WaiterId),
}

/// Effects of one state change, in delivery order.
#[must_use = "grants and idle triggers must be delivered"]
#[derive(Debug)]
pub(crate) struct Transition<N> {
    pub(crate) grants: Vec<Grant<N>>,
    pub(crate) idle: Option<IdleTrigger>,
}

impl<N> Transition<N> {
    pub(crate) fn none() -> Self {
        Self {
            grants: Vec::new(),
            idle: None,
        }
    }

    pub(crate) fn granted(grant: Grant<N>) -> Self {
        Self {
            grants: vec![grant],
            idle: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PoolState<N> {
    name: String,
    size: Capacity,
    usage: usize,
    queue: VecDeque<Waiter<N>>,
    next_waiter: u64,
    idle: IdleSignal,
}

impl<N> PoolState<N> {
    pub(crate) fn new(name: impl Into<String>, size: Capacity) -> Self {
        Self {
            name: name.into(),
            size,
            usage: 0,
            queue: VecDeque::new(),
            next_waiter: 0,
            idle: IdleSignal::fulfilled(),
        }
    }

    pub(crate) fn size(&self) -> Capacity {
        self.size
    }

    pub(crate) fn usage(&self) -> usize {
        self.usage
    }

    pub(crate) fn availability(&self) -> Capacity {
        self.size.remaining_after(self.usage)
    }

    /// Waiters still owed a grant.
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.usage == 0 && self.queue.is_empty()
    }

    /// An idle pool whose trigger is still on its way out of the lock gives a
    /// notification that is already complete.
    pub(crate) fn when_idle(&self) -> WhenIdle {
        if self.is_idle() {
            WhenIdle::ready()
        } else {
            self.idle.subscribe()
        }
    }

    /// Grant `demand` now if it fits, otherwise queue it behind earlier waiters.
    ///
    /// A request that fits is still granted while others wait: only the drain
    /// is ordered, admission of a fitting request is not held back.
    pub(crate) fn request(&mut self, demand: Demand, notifier: N) -> Admission<N> {
        if let Some(units) = self.units_if_fits(demand) {
            self.usage = self.usage.saturating_add(units);
            tracing::debug!(pool = %self.name, %demand, units, usage = self.usage, "Granted immediately");
            self.settle_busy();
            return Admission::Granted(Grant { notifier, units });
        }

        let id = WaiterId(self.next_waiter);
        self.next_waiter = self.next_waiter.wrapping_add(1);
        self.queue.push_back(Waiter {
            id,
            demand,
            notifier,
        });
        tracing::debug!(pool = %self.name, waiter = %id, %demand, usage = self.usage, "Queued");
        self.idle.arm();
        Admission::Queued(id)
    }

    /// Admit a queued waiter regardless of capacity.
    ///
    /// A waiter already granted (by a drain or an earlier force) yields no grant.
    pub(crate) fn force(&mut self, id: WaiterId) -> Transition<N> {
        let Some(waiter) = self
            .queue
            .iter()
            .position(|w| w.id == id)
            .and_then(|idx| self.queue.remove(idx))
        else {
            return Transition::none();
        };

        let units = match waiter.demand {
            Demand::Units(n) => n,
            Demand::All => self.size.get().unwrap_or(0),
        };
        self.usage = self.usage.saturating_add(units);
        tracing::debug!(pool = %self.name, waiter = %id, units, usage = self.usage, "Forced admission");
        if !self.size.fits(self.usage) {
            tracing::warn!(
                pool = %self.name,
                usage = self.usage,
                size = %self.size,
                "Usage burst above pool size"
            );
        }

        let mut transition = self.drain();
        transition.grants.insert(
            0,
            Grant {
                notifier: waiter.notifier,
                units,
            },
        );
        transition
    }

    /// Return `units` to the pool and grant whatever now fits.
    pub(crate) fn release(&mut self, units: usize) -> Transition<N> {
        if units > self.usage {
            tracing::error!(pool = %self.name, units, usage = self.usage, "Released more units than in use");
        }
        self.usage = self.usage.saturating_sub(units);
        tracing::trace!(pool = %self.name, units, usage = self.usage, "Released units");
        self.drain()
    }

    /// Change the declared size. Granted units are never revoked.
    pub(crate) fn set_size(&mut self, size: Capacity) -> Transition<N> {
        tracing::debug!(pool = %self.name, from = %self.size, to = %size, usage = self.usage, "Pool resized");
        self.size = size;
        self.drain()
    }

    /// Walk the queue from the front, granting waiters in order until one
    /// does not fit.
    fn drain(&mut self) -> Transition<N> {
        let mut grants = Vec::new();

        while let Some(front) = self.queue.front() {
            let Some(units) = self.units_if_fits(front.demand) else {
                break;
            };
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.usage = self.usage.saturating_add(units);
            tracing::debug!(
                pool = %self.name,
                waiter = %waiter.id,
                units,
                usage = self.usage,
                "Granted queued waiter"
            );
            grants.push(Grant {
                notifier: waiter.notifier,
                units,
            });
        }

        let idle = self.settle();
        Transition { grants, idle }
    }

    /// Units to grant for `demand` right now, or `None` if it must wait.
    fn units_if_fits(&self, demand: Demand) -> Option<usize> {
        match demand {
            Demand::Units(n) => self.availability().fits(n).then_some(n),
            Demand::All => match self.size {
                Capacity::Bounded(n) if n > 0 && self.usage == 0 => Some(n),
                _ => None,
            },
        }
    }

    /// Fire the idle signal if idle, otherwise make sure one is pending.
    fn settle(&mut self) -> Option<IdleTrigger> {
        if self.is_idle() {
            let trigger = self.idle.take_trigger();
            if trigger.is_some() {
                tracing::debug!(pool = %self.name, "Pool idle");
            }
            trigger
        } else {
            self.idle.arm();
            None
        }
    }

    /// Immediate grants can only raise usage; a zero-unit grant leaves an idle
    /// pool idle.
    fn settle_busy(&mut self) {
        if !self.is_idle() {
            self.idle.arm();
        }
    }
}

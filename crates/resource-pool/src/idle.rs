//! Idle notification: fulfilled once per idle period.
//!
//! Every subscriber taken during a busy period shares one pending signal. The
//! signal is fired when the pool drains to zero usage with an empty queue, and
//! a fresh pending signal is armed as soon as the pool becomes busy again.
//! Subscribers taken while idle are fulfilled from the start.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

fn fired() -> Shared<oneshot::Receiver<()>> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(());
    rx.shared()
}

/// Fires one idle period's signal. Delivered outside the pool lock.
#[must_use = "the idle signal only fires when the trigger is fired"]
#[derive(Debug)]
pub(crate) struct IdleTrigger(oneshot::Sender<()>);

impl IdleTrigger {
    pub(crate) fn fire(self) {
        // Cannot fail while the signal that owns the receiver is alive; a
        // dropped pool has nobody left to notify.
        let _ = self.0.send(());
    }
}

pub(crate) struct IdleSignal {
    /// Present while the current period's signal is pending.
    trigger: Option<oneshot::Sender<()>>,
    signal: Shared<oneshot::Receiver<()>>,
}

impl fmt::Debug for IdleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleSignal")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl IdleSignal {
    /// A signal that is already fulfilled: a new pool starts idle.
    pub(crate) fn fulfilled() -> Self {
        Self {
            trigger: None,
            signal: fired(),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.trigger.is_some()
    }

    /// Start a new pending period unless one is already pending.
    pub(crate) fn arm(&mut self) {
        if self.trigger.is_none() {
            let (tx, rx) = oneshot::channel();
            self.trigger = Some(tx);
            self.signal = rx.shared();
        }
    }

    /// End the pending period, if any. The caller fires the trigger.
    pub(crate) fn take_trigger(&mut self) -> Option<IdleTrigger> {
        self.trigger.take().map(IdleTrigger)
    }

    pub(crate) fn subscribe(&self) -> WhenIdle {
        WhenIdle {
            signal: self.signal.clone(),
        }
    }
}

/// Completes when the pool it was taken from is idle.
///
/// Taken while the pool is idle, it is already complete. Taken while busy, it
/// completes when the pool next reaches zero usage with no queued waiters, and
/// stays complete afterwards even if the pool becomes busy again.
#[derive(Clone)]
#[must_use = "futures do nothing unless polled"]
pub struct WhenIdle {
    signal: Shared<oneshot::Receiver<()>>,
}

impl fmt::Debug for WhenIdle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenIdle")
            .field("idle", &self.is_idle())
            .finish()
    }
}

impl WhenIdle {
    pub(crate) fn ready() -> Self {
        Self { signal: fired() }
    }

    /// Whether the idle period this notification belongs to has been reached.
    pub fn is_idle(&self) -> bool {
        self.signal.clone().now_or_never().is_some()
    }
}

impl Future for WhenIdle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.signal).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            Poll::Ready(Err(_)) => {
                // Pool state dropped while busy: nothing can hold units any more.
                tracing::debug!("Pool dropped before idle signal fired");
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_fulfilled() {
        let signal = IdleSignal::fulfilled();
        assert!(!signal.is_pending());
        assert!(signal.subscribe().is_idle());
    }

    #[test]
    fn arm_then_fire() {
        let mut signal = IdleSignal::fulfilled();
        let before = signal.subscribe();

        signal.arm();
        assert!(signal.is_pending());
        let during = signal.subscribe();
        assert!(!during.is_idle());
        // Notifications from an earlier idle period stay fulfilled.
        assert!(before.is_idle());

        signal.take_trigger().expect("pending signal has a trigger").fire();
        assert!(during.is_idle());
        assert!(signal.take_trigger().is_none());
    }

    #[test]
    fn arm_is_idempotent_while_pending() {
        let mut signal = IdleSignal::fulfilled();
        signal.arm();
        let first = signal.subscribe();
        signal.arm();
        let second = signal.subscribe();

        signal.take_trigger().unwrap().fire();
        assert!(first.is_idle());
        assert!(second.is_idle());
    }

    #[tokio::test]
    async fn await_completes_after_fire() {
        let mut signal = IdleSignal::fulfilled();
        signal.arm();
        let when_idle = signal.subscribe();
        let trigger = signal.take_trigger().unwrap();

        let waiter = tokio::spawn(when_idle);
        trigger.fire();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_signal_completes_waiters() {
        let mut signal = IdleSignal::fulfilled();
        signal.arm();
        let when_idle = signal.subscribe();
        drop(signal);
        when_idle.await;
    }
}

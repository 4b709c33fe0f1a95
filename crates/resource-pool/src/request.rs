//! Allocation requests: await the grant, read it synchronously, or force it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::allocation::Allocation;
use crate::error::PoolError;
use crate::pool::PoolShared;
use crate::state::WaiterId;

/// A pending or fulfilled request for units.
///
/// Await it for the [`Allocation`], or read it synchronously with
/// [`fail_fast`](Self::fail_fast). Once a value or a failure has been observed
/// it is cached; later reads return the same allocation.
#[must_use = "a dropped request still holds its place in the queue until granted"]
pub struct AllocationRequest {
    /// Taken once the grant (or the pool's disappearance) has been observed.
    receiver: Option<oneshot::Receiver<Allocation>>,
    outcome: Option<Result<Allocation, PoolError>>,
}

impl AllocationRequest {
    pub(crate) fn new(receiver: oneshot::Receiver<Allocation>) -> Self {
        Self {
            receiver: Some(receiver),
            outcome: None,
        }
    }

    /// The allocation, if it has been granted already.
    ///
    /// Never waits and never forces. Returns
    /// [`ResolutionPending`](PoolError::ResolutionPending) while the request is
    /// still queued; that failure is not cached, so the request can still be
    /// awaited or forced afterwards.
    pub fn fail_fast(&mut self) -> Result<Allocation, PoolError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone().map_err(PoolError::repeated);
        }
        self.try_receive().unwrap_or(Err(PoolError::ResolutionPending))
    }

    /// Whether a grant (or a failure) has been observed or is ready to read.
    pub fn is_resolved(&mut self) -> bool {
        self.outcome.is_some() || self.try_receive().is_some()
    }

    /// Await the allocation, run `handler` with it, and release every unit of
    /// the allocation once the handler's future has completed.
    ///
    /// Units are released whether the handler succeeds, fails, or unwinds, and
    /// also if the returned future is dropped before completing.
    pub async fn and_then<F, Fut, T, E>(self, handler: F) -> Result<T, E>
    where
        F: FnOnce(Allocation) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let allocation = self.await?;
        let _release = ReleaseOnDrop(allocation.clone());
        handler(allocation).await
    }

    /// Non-blocking read of the channel, caching anything final.
    fn try_receive(&mut self) -> Option<Result<Allocation, PoolError>> {
        let receiver = self.receiver.as_mut()?;
        let outcome = match receiver.try_recv() {
            Ok(allocation) => Ok(allocation),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(PoolError::PoolClosed),
        };
        Some(self.finish(outcome))
    }

    fn finish(&mut self, outcome: Result<Allocation, PoolError>) -> Result<Allocation, PoolError> {
        self.receiver = None;
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Future for AllocationRequest {
    type Output = Result<Allocation, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = &self.outcome {
            return Poll::Ready(outcome.clone());
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(Err(PoolError::PoolClosed));
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(allocation)) => Poll::Ready(self.finish(Ok(allocation))),
            Poll::Ready(Err(_)) => Poll::Ready(self.finish(Err(PoolError::PoolClosed))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for AllocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRequest")
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Releases every unit of an allocation when dropped.
struct ReleaseOnDrop(Allocation);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release_all();
    }
}

/// Admits one queued waiter regardless of capacity.
pub(crate) struct ForceResolver {
    pool: Arc<PoolShared>,
    waiter: WaiterId,
}

impl ForceResolver {
    pub(crate) fn new(pool: Arc<PoolShared>, waiter: WaiterId) -> Self {
        Self { pool, waiter }
    }

    fn resolve(&self) {
        self.pool.force(self.waiter);
    }
}

/// A request for a fixed number of units, which can also be forced.
///
/// Forcing grants the units immediately even if the pool has no room, pushing
/// usage above the pool size until enough units are released.
#[must_use = "a dropped request still holds its place in the queue until granted"]
pub struct PartialAllocationRequest {
    request: AllocationRequest,
    /// Present while the request is queued and has not been forced.
    resolver: Option<ForceResolver>,
}

impl PartialAllocationRequest {
    pub(crate) fn new(request: AllocationRequest, resolver: Option<ForceResolver>) -> Self {
        Self { request, resolver }
    }

    /// See [`AllocationRequest::fail_fast`].
    pub fn fail_fast(&mut self) -> Result<Allocation, PoolError> {
        self.request.fail_fast()
    }

    /// The allocation now, bursting beyond the pool size if needed.
    ///
    /// The first call admits the request if it is still queued. Later calls
    /// return the same allocation, or repeat the first failure as
    /// [`AlreadyFailed`](PoolError::AlreadyFailed).
    pub fn force(&mut self) -> Result<Allocation, PoolError> {
        if let Some(outcome) = &self.request.outcome {
            return outcome.clone().map_err(PoolError::repeated);
        }
        let resolver = self.resolver.take();
        if let Some(resolver) = &resolver {
            resolver.resolve();
        }
        match self.request.try_receive() {
            Some(outcome) => outcome,
            None => {
                let pool = resolver.as_ref().map_or("", |r| r.pool.name());
                tracing::error!(pool, "Forced resolution produced no allocation");
                self.request.finish(Err(PoolError::ResolverMissing))
            }
        }
    }

    /// Whether the request was queued and has been neither forced nor read.
    pub fn is_forceable(&self) -> bool {
        self.resolver.is_some() && self.request.outcome.is_none()
    }

    /// See [`AllocationRequest::is_resolved`].
    pub fn is_resolved(&mut self) -> bool {
        self.request.is_resolved()
    }

    /// See [`AllocationRequest::and_then`].
    pub async fn and_then<F, Fut, T, E>(self, handler: F) -> Result<T, E>
    where
        F: FnOnce(Allocation) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        self.request.and_then(handler).await
    }

    /// Drop the ability to force and keep the plain request.
    pub fn into_request(self) -> AllocationRequest {
        self.request
    }
}

impl Future for PartialAllocationRequest {
    type Output = Result<Allocation, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.request).poll(cx)
    }
}

impl fmt::Debug for PartialAllocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialAllocationRequest")
            .field("outcome", &self.request.outcome)
            .field("forceable", &self.resolver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Pool, PoolError};

    #[test]
    fn immediate_grant_reads_synchronously() {
        let pool = Pool::new(2);
        let mut request = pool.allocate(2);
        assert!(!request.is_forceable());
        assert!(request.is_resolved());

        let allocation = request.fail_fast().unwrap();
        assert_eq!(allocation.size(), 2);
        // Cached: the same grant again, usage unchanged.
        let again = request.fail_fast().unwrap();
        assert_eq!(again.remaining(), 2);
        assert_eq!(pool.usage(), 2);
    }

    #[test]
    fn fail_fast_on_queued_request_is_pending_and_retryable() {
        let pool = Pool::new(1);
        let holder = pool.allocate_one().fail_fast().unwrap();
        let mut request = pool.allocate_one();

        assert_eq!(request.fail_fast().unwrap_err(), PoolError::ResolutionPending);
        assert_eq!(request.fail_fast().unwrap_err(), PoolError::ResolutionPending);
        assert!(request.is_forceable());

        holder.release_all();
        let allocation = request.fail_fast().unwrap();
        assert_eq!(allocation.size(), 1);
        assert_eq!(pool.usage(), 1);
    }

    #[test]
    fn force_is_idempotent() {
        let pool = Pool::new(1);
        let _holder = pool.allocate_one().fail_fast().unwrap();
        let mut request = pool.allocate(2);

        let forced = request.force().unwrap();
        assert_eq!(forced.size(), 2);
        assert_eq!(pool.usage(), 3);
        assert!(!request.is_forceable());

        let again = request.force().unwrap();
        assert_eq!(again.size(), 2);
        assert_eq!(pool.usage(), 3);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn force_after_grant_returns_granted_allocation() {
        let pool = Pool::new(1);
        let holder = pool.allocate_one().fail_fast().unwrap();
        let mut request = pool.allocate_one();

        holder.release_all();
        let allocation = request.force().unwrap();
        assert_eq!(allocation.size(), 1);
        assert_eq!(pool.usage(), 1);
    }

    #[test]
    fn force_on_immediate_grant_returns_it() {
        let pool = Pool::new(3);
        let mut request = pool.allocate(3);
        let allocation = request.force().unwrap();
        assert_eq!(allocation.size(), 3);
        assert_eq!(pool.usage(), 3);
    }

    #[test]
    fn failure_is_cached_and_repeated() {
        let pool = Pool::new(0);
        let mut request = pool.allocate_all();
        drop(pool);

        // Nothing keeps the pool alive for an unforceable request.
        assert_eq!(request.fail_fast().unwrap_err(), PoolError::PoolClosed);
        assert_eq!(
            request.fail_fast().unwrap_err(),
            PoolError::AlreadyFailed(Box::new(PoolError::PoolClosed))
        );
    }

    #[tokio::test]
    async fn await_resolves_when_released() {
        let pool = Pool::new(1);
        let holder = pool.allocate_one().await.unwrap();
        let request = pool.allocate_one();

        let waiter = tokio::spawn(request);
        tokio::task::yield_now().await;
        assert_eq!(pool.queued(), 1);

        holder.release_all();
        let allocation = waiter.await.unwrap().unwrap();
        assert_eq!(allocation.size(), 1);
        assert_eq!(pool.usage(), 1);
    }

    #[tokio::test]
    async fn awaiting_forced_request_yields_forced_allocation() {
        let pool = Pool::new(0);
        let mut request = pool.allocate(2);
        let forced = request.force().unwrap();

        let awaited = (&mut request).await.unwrap();
        assert_eq!(awaited.size(), forced.size());
        assert_eq!(pool.usage(), 2);
    }

    #[tokio::test]
    async fn and_then_releases_after_handler_completes() {
        let pool = Pool::new(2);
        let (tx, rx) = tokio::sync::oneshot::channel::<&'static str>();

        let task = tokio::spawn(pool.allocate(2).and_then(|allocation| async move {
            assert_eq!(allocation.size(), 2);
            let value = rx.await.map_err(anyhow::Error::from)?;
            Ok::<_, anyhow::Error>(value)
        }));

        tokio::task::yield_now().await;
        assert_eq!(pool.usage(), 2);

        tx.send("Hello!").unwrap();
        assert_eq!(task.await.unwrap().unwrap(), "Hello!");
        assert_eq!(pool.usage(), 0);
        assert!(pool.when_idle().is_idle());
    }

    #[tokio::test]
    async fn and_then_releases_on_handler_error() {
        let pool = Pool::new(1);
        let result = pool
            .allocate_one()
            .and_then(|_allocation| async { Err::<(), _>(anyhow::anyhow!("handler failed")) })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "handler failed");
        assert_eq!(pool.usage(), 0);
    }

    #[tokio::test]
    async fn and_then_releases_even_if_handler_kept_a_clone() {
        let pool = Pool::new(1);
        let mut kept = None;
        let value = pool
            .allocate_one()
            .and_then(|allocation| {
                kept = Some(allocation);
                async { Ok::<_, PoolError>(7) }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(pool.usage(), 0);
        assert_eq!(kept.map(|a| a.remaining()), Some(0));
    }

    #[tokio::test]
    async fn and_then_waits_for_grant() {
        let pool = Pool::new(1);
        let holder = pool.allocate_one().fail_fast().unwrap();

        let task = tokio::spawn(
            pool.allocate_all()
                .and_then(|allocation| async move { Ok::<_, PoolError>(allocation.size()) }),
        );
        tokio::task::yield_now().await;
        assert_eq!(pool.queued(), 1);

        holder.release_all();
        assert_eq!(task.await.unwrap().unwrap(), 1);
        assert_eq!(pool.usage(), 0);
    }
}

//! Per-route admission gate bounding the number of in-flight upstream requests.
//!
//! `ConcurrencyLimiter` is a two-variant enum so call sites never have to special-case
//! routes without a cap: the `Unbounded` variant admits everything and every operation
//! on it is a successful no-op. The `Bounded` variant is a counting semaphore built on
//! `tokio::sync::Semaphore`, with an explicit in-use counter so that a `release` without
//! a matching acquire can be detected and ignored.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum ConcurrencyLimiter {
    Unbounded,
    Bounded(BoundedLimiter),
}

#[derive(Debug)]
pub struct BoundedLimiter {
    max: usize,
    semaphore: Semaphore,
    in_use: AtomicUsize,
}

impl BoundedLimiter {
    fn new(max: usize) -> Self {
        Self {
            max,
            semaphore: Semaphore::new(max),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Consume a semaphore permit and account for it in `in_use`.
    fn admit(&self, permit: tokio::sync::SemaphorePermit<'_>) {
        permit.forget();
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.semaphore.add_permits(1);
        }
    }
}

impl ConcurrencyLimiter {
    /// `max == 0` means unlimited.
    pub fn new(max: u32) -> Self {
        if max == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(BoundedLimiter::new(max as usize))
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, Self::Bounded(_))
    }

    /// Non-blocking admission.
    pub fn try_acquire(&self) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(inner) => match inner.semaphore.try_acquire() {
                Ok(permit) => {
                    inner.admit(permit);
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Wait up to `timeout` for a slot.
    pub async fn acquire_timeout(&self, timeout: Duration) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(inner) => {
                match tokio::time::timeout(timeout, inner.semaphore.acquire()).await {
                    Ok(Ok(permit)) => {
                        inner.admit(permit);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// Wait for a slot until `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(inner) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    result = inner.semaphore.acquire() => match result {
                        Ok(permit) => {
                            inner.admit(permit);
                            true
                        }
                        Err(_) => false,
                    },
                }
            }
        }
    }

    /// Return one slot. A release with nothing held is ignored.
    pub fn release(&self) {
        if let Self::Bounded(inner) = self {
            inner.release();
        }
    }

    /// Free slots; `usize::MAX` for an unbounded limiter.
    pub fn available(&self) -> usize {
        match self {
            Self::Unbounded => usize::MAX,
            Self::Bounded(inner) => inner.semaphore.available_permits(),
        }
    }

    pub fn in_use(&self) -> usize {
        match self {
            Self::Unbounded => 0,
            Self::Bounded(inner) => inner.in_use.load(Ordering::Acquire),
        }
    }

    pub fn max(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(inner) => Some(inner.max),
        }
    }

    /// RAII admission: the slot is released when the permit is dropped.
    pub fn try_permit(self: &Arc<Self>) -> Option<LimiterPermit> {
        if self.try_acquire() {
            Some(LimiterPermit {
                limiter: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

/// Holds one slot of a [`ConcurrencyLimiter`] for as long as it lives.
///
/// The permit keeps its own limiter alive, so a reload that replaces the route's
/// limiter does not affect requests admitted by the previous one.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_enforced() {
        let limiter = ConcurrencyLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_use(), 3);
        assert_eq!(limiter.available(), 0);

        limiter.release();
        assert_eq!(limiter.in_use(), 2);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let limiter = ConcurrencyLimiter::new(2);
        limiter.release();
        limiter.release();
        assert_eq!(limiter.available(), 2);
        assert_eq!(limiter.in_use(), 0);

        assert!(limiter.try_acquire());
        limiter.release();
        limiter.release();
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn test_unbounded_always_admits() {
        let limiter = ConcurrencyLimiter::new(0);
        assert!(!limiter.is_bounded());
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
        limiter.release();
        assert_eq!(limiter.in_use(), 0);
        assert_eq!(limiter.available(), usize::MAX);
        assert_eq!(limiter.max(), None);
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let permit = limiter.try_permit().unwrap();
        assert!(limiter.try_permit().is_none());
        drop(permit);
        assert!(limiter.try_permit().is_some());
        assert_eq!(limiter.max(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_expires() {
        let limiter = ConcurrencyLimiter::new(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.acquire_timeout(Duration::from_millis(50)).await);
        assert_eq!(limiter.in_use(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_succeeds_after_release() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        assert!(limiter.try_acquire());

        let releaser = Arc::clone(&limiter);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release();
        });

        assert!(limiter.acquire_timeout(Duration::from_secs(5)).await);
        assert_eq!(limiter.in_use(), 1);
    }

    #[tokio::test]
    async fn test_acquire_honours_cancellation() {
        let limiter = ConcurrencyLimiter::new(1);
        assert!(limiter.try_acquire());

        let token = CancellationToken::new();
        token.cancel();
        assert!(!limiter.acquire(&token).await);

        limiter.release();
        let token = CancellationToken::new();
        assert!(limiter.acquire(&token).await);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_release_loses_no_updates() {
        let limiter = Arc::new(ConcurrencyLimiter::new(8));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let token = CancellationToken::new();
                    assert!(limiter.acquire(&token).await);
                    tokio::task::yield_now().await;
                    limiter.release();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(limiter.in_use(), 0);
        assert_eq!(limiter.available(), 8);
    }
}

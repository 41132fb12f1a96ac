use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use shared::{DetectorError, Result};

/// Bounds how many machines may be starting at the same time
///
/// Capacity comes from `max_vmstartup_count`; zero degrades to a binary
/// lock. Permits are released when dropped.
#[derive(Debug, Clone)]
pub struct MachineLock {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl MachineLock {
    pub fn new(max_vmstartup_count: usize) -> Self {
        let capacity = max_vmstartup_count.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently handed out.
    pub fn held(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Non-blocking check: takes a permit and gives it straight back.
    pub fn is_free(&self) -> bool {
        self.try_acquire().is_some()
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DetectorError::Operational("machine lock closed".to_string()))
    }
}

/// Number of execution units currently alive
#[derive(Debug, Clone, Default)]
pub struct ActiveAnalyses {
    count: Arc<AtomicUsize>,
}

impl ActiveAnalyses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Count one analysis in until the returned guard is dropped.
    pub fn enter(&self) -> ActiveGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            count: Arc::clone(&self.count),
        }
    }
}

#[derive(Debug)]
pub struct ActiveGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_is_a_binary_lock() {
        let lock = MachineLock::new(0);
        assert_eq!(lock.capacity(), 1);

        let permit = lock.try_acquire().unwrap();
        assert!(!lock.is_free());
        assert_eq!(lock.held(), 1);

        drop(permit);
        assert!(lock.is_free());
        assert_eq!(lock.held(), 0);
    }

    #[test]
    fn test_is_free_does_not_keep_a_permit() {
        let lock = MachineLock::new(2);
        assert!(lock.is_free());
        assert!(lock.is_free());
        assert_eq!(lock.held(), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let lock = MachineLock::new(1);
        let permit = lock.acquire().await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap().unwrap();
        assert_eq!(lock.held(), 0);
    }

    #[test]
    fn test_active_guard_decrements_on_every_exit() {
        let active = ActiveAnalyses::new();
        let first = active.enter();
        let second = active.enter();
        assert_eq!(active.get(), 2);

        drop(first);
        assert_eq!(active.get(), 1);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = second;
            panic!("analysis blew up");
        }));
        assert!(result.is_err());
        assert_eq!(active.get(), 0);
    }

    proptest! {
        #[test]
        fn held_permits_never_exceed_capacity(
            capacity in 0usize..6,
            ops in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let lock = MachineLock::new(capacity);
            let mut permits = Vec::new();

            for dispatch in ops {
                if dispatch {
                    if let Some(permit) = lock.try_acquire() {
                        permits.push(permit);
                    }
                } else {
                    permits.pop();
                }
                prop_assert!(lock.held() <= lock.capacity());
                prop_assert_eq!(lock.held(), permits.len());
            }
        }
    }
}

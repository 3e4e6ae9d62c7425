use dashmap::DashMap;
use nexus_core::{NexusError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Advisory per-target locks. Held from execution through completion or
/// rollback so two actions never interleave on the same resource.
#[derive(Default)]
pub struct ResourceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for `target`. Fails with `ResourceBusy`.
    pub async fn acquire(&self, target: &str, timeout: Duration) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!(target, timeout_ms = timeout.as_millis() as u64, "resource lock timed out");
                Err(NexusError::ResourceBusy(target.to_string()))
            }
        }
    }

    pub fn is_locked(&self, target: &str) -> bool {
        self.locks
            .get(target)
            .is_some_and(|l| l.try_lock().is_err())
    }

    /// Drop lock entries nobody holds or waits on.
    pub fn cleanup(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, l| Arc::strong_count(l) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let locks = ResourceLocks::new();
        let guard = locks.acquire("svc:web", Duration::from_millis(50)).await.unwrap();
        assert!(locks.is_locked("svc:web"));
        let err = locks
            .acquire("svc:web", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::ResourceBusy(t) if t == "svc:web"));
        // Other targets are independent.
        let _other = locks.acquire("svc:db", Duration::from_millis(20)).await.unwrap();
        drop(guard);
        assert!(!locks.is_locked("svc:web"));
        assert!(locks.acquire("svc:web", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_keeps_held_locks() {
        let locks = ResourceLocks::new();
        let held = locks.acquire("a", Duration::from_millis(10)).await.unwrap();
        drop(locks.acquire("b", Duration::from_millis(10)).await.unwrap());
        assert_eq!(locks.cleanup(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.cleanup(), 1);
        assert!(locks.is_empty());
    }
}

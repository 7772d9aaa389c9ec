use super::WorkflowStateStore;
use crate::error::{WorkflowError, WorkflowResult};
use crate::types::RunId;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// How long a run lock lease lasts and how hard to try for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    50
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl LockPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Run `f` while holding the lock of `run_id`.
///
/// The lease is released when `f` returns, fails or panics. A holder that
/// dies without releasing is evicted once its lease expires.
pub async fn with_run_lock<T, F, Fut>(
    store: &dyn WorkflowStateStore,
    run_id: RunId,
    policy: &LockPolicy,
    f: F,
) -> WorkflowResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = WorkflowResult<T>>,
{
    let holder = uuid::Uuid::new_v4().to_string();
    let attempts = policy.max_attempts.max(1);

    let mut acquired = false;
    for attempt in 1..=attempts {
        if store
            .try_acquire_run_lock(run_id, &holder, policy.ttl())
            .await?
        {
            acquired = true;
            break;
        }
        if attempt < attempts {
            tracing::debug!(
                "Run lock busy: run_id={}, attempt {}/{}",
                run_id,
                attempt,
                attempts
            );
            tokio::time::sleep(policy.retry_delay()).await;
        }
    }

    if !acquired {
        tracing::warn!("Gave up waiting for run lock: run_id={}", run_id);
        return Err(WorkflowError::LockAcquisitionTimeout { run_id, attempts });
    }

    let outcome = AssertUnwindSafe(f()).catch_unwind().await;

    if let Err(e) = store.release_run_lock(run_id, &holder).await {
        tracing::warn!("Failed to release run lock: run_id={}, error={:#}", run_id, e);
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RedbStateStore;
    use tempfile::TempDir;

    fn store() -> (TempDir, RedbStateStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStateStore::new(dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    fn quick_policy() -> LockPolicy {
        LockPolicy {
            ttl_ms: 60_000,
            max_attempts: 3,
            retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_lock_released_after_success_and_error() {
        let (_dir, store) = store();
        let run_id = RunId::new();

        let value = with_run_lock(&store, run_id, &quick_policy(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let failed: WorkflowResult<()> = with_run_lock(&store, run_id, &quick_policy(), || async {
            Err(WorkflowError::WorkflowNotFound("x".to_string()))
        })
        .await;
        assert!(failed.is_err());

        // Both calls released, so a fresh holder gets the lock straight away
        assert!(store
            .try_acquire_run_lock(run_id, "someone-else", Duration::from_secs(1))
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_timeout_when_held() {
        let (_dir, store) = store();
        let run_id = RunId::new();
        assert!(store
            .try_acquire_run_lock(run_id, "other-worker", Duration::from_secs(60))
            .unwrap());

        let result = with_run_lock(&store, run_id, &quick_policy(), || async { Ok(()) }).await;
        match result {
            Err(WorkflowError::LockAcquisitionTimeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected lock timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (_dir, store) = store();
        let run_id = RunId::new();
        assert!(store
            .try_acquire_run_lock(run_id, "crashed-worker", Duration::from_millis(0))
            .unwrap());

        let value = with_run_lock(&store, run_id, &quick_policy(), || async { Ok("ran") })
            .await
            .unwrap();
        assert_eq!(value, "ran");
    }

    #[tokio::test]
    async fn test_lock_released_after_panic() {
        let (_dir, store) = store();
        let run_id = RunId::new();

        let panicked = AssertUnwindSafe(with_run_lock(
            &store,
            run_id,
            &quick_policy(),
            || async {
                if run_id.0.is_nil() {
                    return Ok(());
                }
                panic!("handler blew up");
            },
        ))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());

        assert!(store
            .try_acquire_run_lock(run_id, "next-worker", Duration::from_secs(1))
            .unwrap());
    }
}

//! Per-role admission pool for subagent runs.
//!
//! Each role gets its own counting gate, created lazily on first use and kept
//! for the pool's lifetime. A role's capacity is its configured limit, or the
//! pool-wide default.
//!
//! Two ways to hold a slot share the same gates:
//! - [`RolePool::acquire`] / [`RolePool::release`]: release is best-effort and
//!   a release with nothing outstanding is a no-op.
//! - [`SimpleRolePool::acquire_permit`]: the returned [`RolePermit`] gives its
//!   slot back on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use subrun_core::role::normalize_role;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Limit used when the configured default is zero.
const FALLBACK_LIMIT: usize = 1;

/// Admission control keyed by role.
#[async_trait]
pub trait RolePool: Send + Sync {
    /// Wait for a slot of `role`, giving up when `cancel` fires.
    async fn acquire(&self, cancel: &CancellationToken, role: &str) -> Result<(), PoolError>;

    /// Return one slot of `role`. Never blocks.
    fn release(&self, role: &str);
}

/// Errors from the role pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The caller's cancellation token fired while waiting.
    #[error("context canceled")]
    Cancelled,

    /// The gate's semaphore was closed.
    #[error("role pool has been closed")]
    Closed,
}

struct RoleGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    /// Slots taken through [`RolePool::acquire`] and not yet released.
    held: Mutex<usize>,
}

impl RoleGate {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            held: Mutex::new(0),
        }
    }
}

/// A slot of one role, returned to the pool when dropped.
#[derive(Debug)]
pub struct RolePermit {
    role: String,
    _permit: OwnedSemaphorePermit,
}

impl RolePermit {
    pub fn role(&self) -> &str {
        &self.role
    }
}

/// Semaphore-per-role pool.
pub struct SimpleRolePool {
    default_limit: usize,
    role_limits: HashMap<String, usize>,
    gates: RwLock<HashMap<String, Arc<RoleGate>>>,
}

impl SimpleRolePool {
    /// Create a pool. Role keys are normalized and zero limits ignored; a zero
    /// default falls back to 1.
    pub fn new<I, S>(default_limit: usize, role_limits: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: AsRef<str>,
    {
        let default_limit = if default_limit == 0 {
            FALLBACK_LIMIT
        } else {
            default_limit
        };
        let role_limits: HashMap<String, usize> = role_limits
            .into_iter()
            .filter(|(_, limit)| *limit > 0)
            .map(|(role, limit)| (normalize_role(role.as_ref()), limit))
            .collect();

        info!(default_limit, roles = role_limits.len(), "RolePool created");

        Self {
            default_limit,
            role_limits,
            gates: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire a slot held by the returned permit.
    pub async fn acquire_permit(
        &self,
        cancel: &CancellationToken,
        role: &str,
    ) -> Result<RolePermit, PoolError> {
        let role = normalize_role(role);
        let gate = self.gate(&role);
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = Arc::clone(&gate.semaphore).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
        };
        Ok(RolePermit {
            role,
            _permit: permit,
        })
    }

    /// Free slots of `role` right now.
    pub fn available(&self, role: &str) -> usize {
        self.gate(&normalize_role(role)).semaphore.available_permits()
    }

    /// Capacity of `role`.
    pub fn limit(&self, role: &str) -> usize {
        self.limit_for(&normalize_role(role))
    }

    pub const fn default_limit(&self) -> usize {
        self.default_limit
    }

    fn limit_for(&self, normalized: &str) -> usize {
        self.role_limits
            .get(normalized)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn gate(&self, normalized: &str) -> Arc<RoleGate> {
        if let Some(gate) = self
            .gates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(normalized)
        {
            return Arc::clone(gate);
        }

        let mut gates = self.gates.write().unwrap_or_else(PoisonError::into_inner);
        let gate = gates.entry(normalized.to_string()).or_insert_with(|| {
            let capacity = self.limit_for(normalized);
            debug!(role = normalized, capacity, "Role gate created");
            Arc::new(RoleGate::new(capacity))
        });
        Arc::clone(gate)
    }
}

impl Default for SimpleRolePool {
    fn default() -> Self {
        Self::new(8, [("frontend", 5), ("backend", 4)])
    }
}

#[async_trait]
impl RolePool for SimpleRolePool {
    async fn acquire(&self, cancel: &CancellationToken, role: &str) -> Result<(), PoolError> {
        let gate = self.gate(&normalize_role(role));
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PoolError::Cancelled),
            permit = gate.semaphore.acquire() => {
                let permit = permit.map_err(|_| PoolError::Closed)?;
                let mut held = gate.held.lock().unwrap_or_else(PoisonError::into_inner);
                permit.forget();
                *held += 1;
                Ok(())
            }
        }
    }

    fn release(&self, role: &str) {
        let gate = self.gate(&normalize_role(role));
        let mut held = gate.held.lock().unwrap_or_else(PoisonError::into_inner);
        if *held == 0 {
            debug!(role, "Release without an outstanding slot ignored");
            return;
        }
        *held -= 1;
        gate.semaphore.add_permits(1);
        debug_assert!(gate.semaphore.available_permits() <= gate.capacity);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool() -> SimpleRolePool {
        SimpleRolePool::new(2, [("Frontend", 1), ("qa", 0)])
    }

    #[tokio::test]
    async fn limits_follow_config() {
        let pool = pool();
        assert_eq!(pool.limit("frontend"), 1);
        assert_eq!(pool.limit(" FRONTEND "), 1);
        assert_eq!(pool.limit("qa"), 2);
        assert_eq!(pool.limit("anything"), 2);
    }

    #[tokio::test]
    async fn zero_default_falls_back_to_one() {
        let pool = SimpleRolePool::new(0, Vec::<(String, usize)>::new());
        assert_eq!(pool.default_limit(), 1);
        assert_eq!(pool.available("backend"), 1);
    }

    #[tokio::test]
    async fn acquire_beyond_limit_blocks_until_release() {
        let pool = Arc::new(pool());
        let cancel = CancellationToken::new();
        pool.acquire(&cancel, "backend").await.unwrap();
        pool.acquire(&cancel, "backend").await.unwrap();
        assert_eq!(pool.available("backend"), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.acquire(&cancel, "backend")).await;
        assert!(blocked.is_err(), "third acquire should block");

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel, "backend").await })
        };
        pool.release("backend");
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("acquire should complete after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn roles_are_independent() {
        let pool = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&cancel, "frontend").await.unwrap();
        assert_eq!(pool.available("frontend"), 0);
        assert_eq!(pool.available("backend"), 2);
    }

    #[tokio::test]
    async fn cancelled_acquire_fails() {
        let pool = Arc::new(pool());
        let cancel = CancellationToken::new();
        pool.acquire(&cancel, "frontend").await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel, "frontend").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
        assert_eq!(pool.available("frontend"), 0);
    }

    #[tokio::test]
    async fn release_without_acquire_is_noop() {
        let pool = pool();
        pool.release("backend");
        pool.release("backend");
        assert_eq!(pool.available("backend"), 2);

        let cancel = CancellationToken::new();
        pool.acquire(&cancel, "backend").await.unwrap();
        pool.release("backend");
        pool.release("backend");
        assert_eq!(pool.available("backend"), 2);
    }

    #[tokio::test]
    async fn permit_returned_on_drop() {
        let pool = pool();
        let cancel = CancellationToken::new();
        {
            let permit = pool.acquire_permit(&cancel, "Frontend").await.unwrap();
            assert_eq!(permit.role(), "frontend");
            assert_eq!(pool.available("frontend"), 0);
        }
        assert_eq!(pool.available("frontend"), 1);
    }

    #[tokio::test]
    async fn permits_and_release_share_gates() {
        let pool = pool();
        let cancel = CancellationToken::new();
        let _permit = pool.acquire_permit(&cancel, "frontend").await.unwrap();
        pool.release("frontend");
        assert_eq!(pool.available("frontend"), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_fails_even_with_capacity() {
        let pool = pool();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            pool.acquire(&cancel, "backend").await,
            Err(PoolError::Cancelled)
        ));
        assert!(matches!(
            pool.acquire_permit(&cancel, "backend").await,
            Err(PoolError::Cancelled)
        ));
    }
}

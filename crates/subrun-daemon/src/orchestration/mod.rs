//! Subagent orchestration: role pool, run types, and run manager.
//!
//! - [`SimpleRolePool`]: per-role concurrency limiter.
//! - [`SubagentManager`]: run registry that spawns, times out, cancels and
//!   collects subagent runs.

pub mod manager;
pub mod pool;
pub mod types;

pub use manager::{ManagerError, ManagerSettings, SubagentManager, SubagentRuntime};
pub use pool::{PoolError, RolePermit, RolePool, SimpleRolePool};
pub use types::{RequestMeta, RunRequest, RunResult, RunStatus};

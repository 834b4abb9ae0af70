//! Subagent run registry.
//!
//! [`SubagentManager`] admits run requests, executes each on its own task and
//! keeps the run until one caller collects its result with
//! [`SubagentManager::wait`].
//!
//! Execution of a run:
//! 1. take a slot of the run's role from the pool
//! 2. make sure the project directory exists
//! 3. resolve tool servers and skills from the configuration layers
//! 4. run the engine under the run budget
//! 5. publish the result, then signal completion

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use subrun_core::config::OrchestratorConfig;
use subrun_core::role::strip_role_prefix;
use subrun_core::{ErrorClassifier, KeywordClassifier};
use tokio::sync::{RwLock as AsyncRwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{RolePool, SimpleRolePool};
use super::types::{RunRequest, RunResult};
use crate::engine::{EngineError, EngineOptions, EngineOutput, ExecutionEngine};
use crate::permission::{PermissionDecider, PermissionHandler};
use crate::resolver;

const NO_RESULT: &str = "run finished without result";

/// Admission and lookup failures. Everything that goes wrong after a run is
/// admitted ends up in its [`RunResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The caller's cancellation token fired.
    #[error("operation canceled")]
    Cancelled,

    #[error("{message}")]
    Validation { message: String },

    #[error("run {id} already exists")]
    AlreadyExists { id: String },

    #[error("run {id} not found")]
    NotFound { id: String },
}

/// Spawn/wait/cancel surface, so hosts can swap run runtimes.
#[async_trait]
pub trait SubagentRuntime: Send + Sync {
    async fn spawn(
        &self,
        cancel: &CancellationToken,
        request: RunRequest,
    ) -> Result<String, ManagerError>;

    async fn wait(&self, cancel: &CancellationToken, run_id: &str)
    -> Result<RunResult, ManagerError>;

    async fn cancel(&self, run_id: &str) -> Result<(), ManagerError>;
}

/// Manager-wide run settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Budget for runs without a positive timeout of their own.
    pub default_timeout: Duration,
    pub max_iterations: u32,
    /// How long an engine gets to stop after its token fires.
    pub cancel_grace: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(900),
            max_iterations: 15,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl ManagerSettings {
    /// Settings from config; zero values keep the defaults.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let defaults = Self::default();
        Self {
            default_timeout: if config.default_timeout_secs == 0 {
                defaults.default_timeout
            } else {
                Duration::from_secs(config.default_timeout_secs)
            },
            max_iterations: if config.max_iterations == 0 {
                defaults.max_iterations
            } else {
                config.max_iterations
            },
            ..defaults
        }
    }
}

/// A registered run. Shared between the registry and the execution task.
struct RunHandle {
    request: Arc<RunRequest>,
    role: String,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    result: Mutex<Option<RunResult>>,
}

impl RunHandle {
    fn publish(&self, result: RunResult) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    fn take_result(&self) -> Option<RunResult> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Fires the completion signal when dropped, so a panicking execution still
/// releases its waiters.
struct CompletionSignal(Arc<RunHandle>);

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.0.done.send_replace(true);
    }
}

/// Gives a role slot back when dropped.
struct SlotGuard {
    pool: Arc<dyn RolePool>,
    role: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(&self.role);
        debug!(role = %self.role, "Role slot released");
    }
}

enum EngineOutcome {
    Finished(Result<EngineOutput, EngineError>),
    TimedOut,
}

/// What an execution task needs; cloned into every run.
#[derive(Clone)]
struct RunContext {
    pool: Arc<dyn RolePool>,
    engine: Arc<dyn ExecutionEngine>,
    classifier: Arc<dyn ErrorClassifier>,
    decider: Arc<RwLock<Option<Arc<dyn PermissionDecider>>>>,
    settings: ManagerSettings,
    #[cfg(feature = "metrics")]
    metrics: Arc<subrun_core::metrics::RunMetrics>,
}

impl RunContext {
    async fn execute(&self, handle: &RunHandle) -> RunResult {
        let request = &handle.request;
        let run_id = request.run_id.as_str();

        let _slot = match self.pool.acquire(&handle.cancel, &handle.role).await {
            Ok(()) => SlotGuard {
                pool: Arc::clone(&self.pool),
                role: handle.role.clone(),
            },
            Err(e) => return RunResult::error(format!("failed to acquire role pool: {e}")),
        };
        debug!(run_id, role = %handle.role, "Role slot acquired");

        let Some(project_dir) = request.project_dir() else {
            return RunResult::error("repo dir is empty");
        };
        if let Err(e) = tokio::fs::create_dir_all(project_dir).await {
            return RunResult::error(format!("failed to create repo dir: {e}"));
        }

        let effective = resolver::resolve(request);
        for warning in &effective.warnings {
            warn!(run_id, %warning, "Configuration warning");
        }

        let budget = request
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.settings.default_timeout);
        let permission = self
            .decider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(|decider| PermissionHandler::new(decider, Arc::clone(request)));

        let options = EngineOptions {
            run_id: request.run_id.clone(),
            project_root: project_dir.to_path_buf(),
            prompt: strip_role_prefix(&request.task).to_string(),
            role: handle.role.clone(),
            system_prompt: request.system_prompt.clone(),
            skills: effective.skills,
            tool_servers: effective.tool_servers,
            max_iterations: self.settings.max_iterations,
            timeout: budget,
            permission,
            metadata: request.meta.clone(),
        };
        info!(
            run_id,
            engine = self.engine.name(),
            budget_secs = budget.as_secs_f64(),
            tool_servers = options.tool_servers.len(),
            skills = options.skills.len(),
            "Starting engine"
        );

        let outcome = self.run_engine(options, &handle.cancel, budget).await;
        self.map_outcome(outcome, &handle.cancel)
            .with_warnings(effective.warnings)
    }

    /// Run the engine until it finishes, the budget runs out, or the run is
    /// cancelled. Engines that ignore their token are abandoned after the
    /// cancel grace period.
    async fn run_engine(
        &self,
        options: EngineOptions,
        run_token: &CancellationToken,
        budget: Duration,
    ) -> EngineOutcome {
        let exec_token = run_token.child_token();
        let run = self.engine.execute(options, exec_token.clone());
        tokio::pin!(run);
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            result = &mut run => EngineOutcome::Finished(result),
            () = &mut deadline => {
                exec_token.cancel();
                if tokio::time::timeout(self.settings.cancel_grace, &mut run).await.is_err() {
                    warn!("Engine did not stop after the run budget expired");
                }
                EngineOutcome::TimedOut
            }
            () = run_token.cancelled() => {
                match tokio::time::timeout(self.settings.cancel_grace, &mut run).await {
                    Ok(result) => EngineOutcome::Finished(result),
                    Err(_) => {
                        warn!("Engine did not stop after cancellation");
                        EngineOutcome::Finished(Err(EngineError::Cancelled))
                    }
                }
            }
        }
    }

    fn map_outcome(&self, outcome: EngineOutcome, run_token: &CancellationToken) -> RunResult {
        match outcome {
            EngineOutcome::TimedOut => RunResult::timeout("subagent run timed out"),
            EngineOutcome::Finished(Ok(output)) => RunResult::ok(output.normalized()),
            EngineOutcome::Finished(Err(_)) if run_token.is_cancelled() => {
                RunResult::error("subagent run canceled")
            }
            EngineOutcome::Finished(Err(err)) => {
                let reason = self.classifier.classify(Some(&err));
                RunResult::error(err.to_string()).with_failover_reason(reason)
            }
        }
    }
}

/// Registry and executor of subagent runs.
pub struct SubagentManager {
    ctx: RunContext,
    runs: Arc<AsyncRwLock<HashMap<String, Arc<RunHandle>>>>,
}

impl SubagentManager {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        pool: Arc<dyn RolePool>,
        settings: ManagerSettings,
    ) -> Self {
        info!(
            engine = engine.name(),
            default_timeout_secs = settings.default_timeout.as_secs(),
            max_iterations = settings.max_iterations,
            "SubagentManager created"
        );
        Self {
            ctx: RunContext {
                pool,
                engine,
                classifier: Arc::new(KeywordClassifier::new()),
                decider: Arc::new(RwLock::new(None)),
                settings,
                #[cfg(feature = "metrics")]
                metrics: Arc::new(subrun_core::metrics::RunMetrics::new()),
            },
            runs: Arc::new(AsyncRwLock::new(HashMap::new())),
        }
    }

    /// Manager with a [`SimpleRolePool`] sized from `config`.
    pub fn from_config(engine: Arc<dyn ExecutionEngine>, config: &OrchestratorConfig) -> Self {
        let pool = SimpleRolePool::new(config.default_limit, config.normalized_role_limits());
        Self::new(engine, Arc::new(pool), ManagerSettings::from_config(config))
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.ctx.classifier = classifier;
        self
    }

    /// Install or clear the permission decider. Runs pick up the decider
    /// present when their engine starts.
    pub fn set_permission_decider(&self, decider: Option<Arc<dyn PermissionDecider>>) {
        *self
            .ctx
            .decider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = decider;
    }

    pub const fn settings(&self) -> &ManagerSettings {
        &self.ctx.settings
    }

    /// Admit a run and start it in the background. Returns the run id.
    pub async fn spawn(
        &self,
        cancel: &CancellationToken,
        request: RunRequest,
    ) -> Result<String, ManagerError> {
        if cancel.is_cancelled() {
            return Err(ManagerError::Cancelled);
        }
        if request.run_id.trim().is_empty() {
            return Err(ManagerError::Validation {
                message: "run id is required".to_string(),
            });
        }
        if request.task.trim().is_empty() {
            return Err(ManagerError::Validation {
                message: "task is required".to_string(),
            });
        }

        let run_id = request.run_id.clone();
        let role = request.effective_role();
        let (done, _) = watch::channel(false);
        let handle = Arc::new(RunHandle {
            request: Arc::new(request),
            role,
            cancel: cancel.child_token(),
            done,
            result: Mutex::new(None),
        });

        {
            let mut runs = self.runs.write().await;
            if runs.contains_key(&run_id) {
                return Err(ManagerError::AlreadyExists { id: run_id });
            }
            runs.insert(run_id.clone(), Arc::clone(&handle));
        }
        info!(run_id = %run_id, role = %handle.role, "Subagent run spawned");
        #[cfg(feature = "metrics")]
        self.ctx.metrics.record_spawn(&handle.role);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _signal = CompletionSignal(Arc::clone(&handle));
            let result = ctx.execute(&handle).await;
            info!(
                run_id = %handle.request.run_id,
                role = %handle.role,
                status = %result.status,
                error = %result.error_message,
                "Subagent run finished"
            );
            #[cfg(feature = "metrics")]
            ctx.metrics.record_finish(&handle.role, result.status.as_str());
            handle.publish(result);
        });

        Ok(run_id)
    }

    /// Wait for a run and collect its result. The run is retired on success,
    /// so a second wait for the same id fails with [`ManagerError::NotFound`].
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        run_id: &str,
    ) -> Result<RunResult, ManagerError> {
        let handle = self
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound {
                id: run_id.to_string(),
            })?;

        let mut done = handle.done.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ManagerError::Cancelled),
            _ = done.wait_for(|finished| *finished) => {}
        }

        let retired = {
            let mut runs = self.runs.write().await;
            match runs.get(run_id) {
                Some(current) if Arc::ptr_eq(current, &handle) => runs.remove(run_id),
                _ => None,
            }
        };
        let result = retired.and_then(|handle| handle.take_result());
        debug!(run_id, found = result.is_some(), "Subagent run collected");
        Ok(result.unwrap_or_else(|| RunResult::error(NO_RESULT)))
    }

    /// Request cancellation of a run. Does not wait for it to stop.
    pub async fn cancel(&self, run_id: &str) -> Result<(), ManagerError> {
        let runs = self.runs.read().await;
        let handle = runs.get(run_id).ok_or_else(|| ManagerError::NotFound {
            id: run_id.to_string(),
        })?;
        handle.cancel.cancel();
        info!(run_id, "Subagent run cancel requested");
        Ok(())
    }

    /// Ids of all tracked runs, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_tracked(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }
}

#[async_trait]
impl SubagentRuntime for SubagentManager {
    async fn spawn(
        &self,
        cancel: &CancellationToken,
        request: RunRequest,
    ) -> Result<String, ManagerError> {
        Self::spawn(self, cancel, request).await
    }

    async fn wait(
        &self,
        cancel: &CancellationToken,
        run_id: &str,
    ) -> Result<RunResult, ManagerError> {
        Self::wait(self, cancel, run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<(), ManagerError> {
        Self::cancel(self, run_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::orchestration::types::RunStatus;
    use subrun_core::FailoverReason;

    /// Engine returning a fixed outcome after an optional delay.
    struct Stub {
        delay: Duration,
        failure: Option<&'static str>,
        honor_cancel: bool,
    }

    #[async_trait]
    impl ExecutionEngine for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn execute(
            &self,
            options: EngineOptions,
            cancel: CancellationToken,
        ) -> Result<EngineOutput, EngineError> {
            if self.honor_cancel {
                tokio::select! {
                    () = cancel.cancelled() => return Err(EngineError::Cancelled),
                    () = tokio::time::sleep(self.delay) => {}
                }
            } else {
                tokio::time::sleep(self.delay).await;
            }
            match self.failure {
                Some(message) => Err(EngineError::Failed {
                    message: message.to_string(),
                }),
                None => Ok(EngineOutput::text(format!("  {} ({})  ", options.prompt, options.role))),
            }
        }
    }

    fn manager(engine: Stub) -> SubagentManager {
        let settings = ManagerSettings {
            cancel_grace: Duration::from_millis(100),
            ..ManagerSettings::default()
        };
        SubagentManager::new(Arc::new(engine), Arc::new(SimpleRolePool::default()), settings)
    }

    fn quick() -> Stub {
        Stub {
            delay: Duration::ZERO,
            failure: None,
            honor_cancel: true,
        }
    }

    fn request(dir: &tempfile::TempDir, id: &str, task: &str) -> RunRequest {
        RunRequest {
            repo_dir: Some(dir.path().join("repo")),
            ..RunRequest::new(id, task)
        }
    }

    #[test]
    fn settings_from_config_keep_defaults_for_zero() {
        let config = OrchestratorConfig {
            default_timeout_secs: 0,
            max_iterations: 0,
            ..OrchestratorConfig::default()
        };
        assert_eq!(ManagerSettings::from_config(&config), ManagerSettings::default());

        let config = OrchestratorConfig {
            default_timeout_secs: 60,
            max_iterations: 3,
            ..OrchestratorConfig::default()
        };
        let settings = ManagerSettings::from_config(&config);
        assert_eq!(settings.default_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_iterations, 3);
    }

    #[tokio::test]
    async fn successful_run_strips_role_marker_and_trims_output() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(quick());
        let cancel = CancellationToken::new();

        let id = manager
            .spawn(&cancel, request(&dir, "run-1", "[frontend] draw a button"))
            .await
            .unwrap();
        let result = manager.wait(&cancel, &id).await.unwrap();

        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.output, "draw a button (frontend)");
        assert!(dir.path().join("repo").is_dir());
    }

    #[tokio::test]
    async fn validation_failures_register_nothing() {
        let manager = manager(quick());
        let cancel = CancellationToken::new();

        let err = manager
            .spawn(&cancel, RunRequest::new(" ", "task"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "run id is required");

        let err = manager
            .spawn(&cancel, RunRequest::new("run-1", ""))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "task is required");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn empty_project_dir_is_a_run_error() {
        let manager = manager(quick());
        let cancel = CancellationToken::new();

        let id = manager
            .spawn(&cancel, RunRequest::new("run-1", "task"))
            .await
            .unwrap();
        let result = manager.wait(&cancel, &id).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_message, "repo dir is empty");
    }

    #[tokio::test]
    async fn engine_failure_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Stub {
            failure: Some("429 too many requests"),
            ..quick()
        });
        let cancel = CancellationToken::new();

        let id = manager
            .spawn(&cancel, request(&dir, "run-1", "task"))
            .await
            .unwrap();
        let result = manager.wait(&cancel, &id).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_message, "429 too many requests");
        assert_eq!(result.failover_reason, Some(FailoverReason::RateLimit));
    }

    #[tokio::test]
    async fn run_budget_expiry_is_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Stub {
            delay: Duration::from_secs(30),
            ..quick()
        });
        let cancel = CancellationToken::new();

        let mut req = request(&dir, "run-1", "task");
        req.timeout = Some(Duration::from_millis(100));
        let id = manager.spawn(&cancel, req).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), manager.wait(&cancel, &id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, RunStatus::Timeout);
        assert_eq!(result.error_message, "subagent run timed out");
    }

    #[tokio::test]
    async fn engine_ignoring_cancel_is_abandoned_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Stub {
            delay: Duration::from_secs(30),
            honor_cancel: false,
            ..quick()
        });
        let cancel = CancellationToken::new();

        let id = manager
            .spawn(&cancel, request(&dir, "run-1", "task"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.cancel(&id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), manager.wait(&cancel, &id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.error_message, "subagent run canceled");
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_run_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Stub {
            delay: Duration::from_millis(200),
            ..quick()
        });
        let cancel = CancellationToken::new();
        let id = manager
            .spawn(&cancel, request(&dir, "run-1", "task"))
            .await
            .unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        assert!(matches!(
            manager.wait(&waiter, &id).await,
            Err(ManagerError::Cancelled)
        ));
        assert!(manager.is_tracked(&id).await);

        let result = manager.wait(&cancel, &id).await.unwrap();
        assert!(result.is_ok());
        assert!(!manager.is_tracked(&id).await);
    }

    #[tokio::test]
    async fn cancelling_spawn_token_cancels_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Stub {
            delay: Duration::from_secs(30),
            ..quick()
        });
        let spawn_token = CancellationToken::new();
        let id = manager
            .spawn(&spawn_token, request(&dir, "run-1", "task"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        spawn_token.cancel();

        let result = manager.wait(&CancellationToken::new(), &id).await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.error_message, "subagent run canceled");
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Stub {
            delay: Duration::from_secs(30),
            ..quick()
        });
        let cancel = CancellationToken::new();
        for id in ["b", "a", "c"] {
            manager.spawn(&cancel, request(&dir, id, "task")).await.unwrap();
        }
        assert_eq!(manager.list().await, vec!["a", "b", "c"]);
        cancel.cancel();
    }
}

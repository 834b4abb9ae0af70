//! Primary/fallback engine pair.

use std::sync::Arc;

use async_trait::async_trait;
use subrun_core::{ErrorClassifier, KeywordClassifier};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::circuit::CircuitBreaker;
use super::{EngineError, EngineOptions, EngineOutput, ExecutionEngine};

/// Runs on the primary engine and switches to the fallback on failures that
/// another backend could avoid (auth, rate limit, billing).
///
/// Repeated switches open a circuit that sends runs straight to the fallback
/// until the cool-down passes.
pub struct FailoverEngine {
    primary: Arc<dyn ExecutionEngine>,
    fallback: Option<Arc<dyn ExecutionEngine>>,
    breaker: CircuitBreaker,
    classifier: Arc<dyn ErrorClassifier>,
}

impl FailoverEngine {
    pub fn new(primary: Arc<dyn ExecutionEngine>, fallback: Option<Arc<dyn ExecutionEngine>>) -> Self {
        Self {
            primary,
            fallback,
            breaker: CircuitBreaker::default(),
            classifier: Arc::new(KeywordClassifier::new()),
        }
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn run_fallback(
        &self,
        options: EngineOptions,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        let Some(fallback) = &self.fallback else {
            return Err(EngineError::Unavailable(
                "primary engine failed and no fallback available".to_string(),
            ));
        };
        fallback.execute(options, cancel).await
    }
}

#[async_trait]
impl ExecutionEngine for FailoverEngine {
    fn name(&self) -> &str {
        "failover"
    }

    async fn execute(
        &self,
        options: EngineOptions,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        if !self.breaker.allow_request() {
            return self.run_fallback(options, cancel).await;
        }

        match self.primary.execute(options.clone(), cancel.clone()).await {
            Ok(output) => {
                self.breaker.record_success();
                Ok(output)
            }
            Err(err) if cancel.is_cancelled() => Err(err),
            Err(err) => {
                let reason = self.classifier.classify(Some(&err));
                if !reason.should_switch_backend() {
                    return Err(err);
                }
                self.breaker.record_failure();
                warn!(
                    run_id = %options.run_id,
                    primary = self.primary.name(),
                    %reason,
                    error = %err,
                    "Primary engine failed, switching to fallback"
                );
                self.run_fallback(options, cancel).await
            }
        }
    }
}

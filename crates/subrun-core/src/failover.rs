//! Failure classification for backend failover.
//!
//! Maps an arbitrary failure onto a small set of retry-relevant reasons by
//! matching keywords in its message. The first matching category in
//! precedence order wins: auth, rate limit, timeout, billing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classified cause of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Auth,
    RateLimit,
    Timeout,
    Billing,
    #[default]
    Unknown,
}

impl FailoverReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Billing => "billing",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a failure with this reason should be retried on another backend.
    ///
    /// Timeouts are classified but not switched on: the run budget is already
    /// spent by the time one is observed.
    pub const fn should_switch_backend(self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit | Self::Billing)
    }
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies failures into [`FailoverReason`]s.
pub trait ErrorClassifier: Send + Sync {
    /// Classify a failure. `None` is always [`FailoverReason::Unknown`].
    fn classify(&self, err: Option<&dyn fmt::Display>) -> FailoverReason;

    /// Whether the failure has a known (non-`Unknown`) reason.
    fn is_failover_error(&self, err: Option<&dyn fmt::Display>) -> bool {
        err.is_some() && self.classify(err) != FailoverReason::Unknown
    }
}

const AUTH_PATTERNS: &[&str] = &[
    "invalid api key",
    "incorrect api key",
    "invalid token",
    "authentication",
    "re-authenticate",
    "unauthorized",
    "forbidden",
    "access denied",
    "expired",
    "401",
    "403",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "quota exceeded",
    "resource_exhausted",
    "usage limit",
    "overloaded",
];

const TIMEOUT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "context deadline exceeded",
];

const BILLING_PATTERNS: &[&str] = &["402", "payment required", "insufficient credits", "billing"];

/// Keyword-based classifier over the lowercased failure message.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    categories: Vec<(FailoverReason, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            categories: vec![
                (FailoverReason::Auth, owned(AUTH_PATTERNS)),
                (FailoverReason::RateLimit, owned(RATE_LIMIT_PATTERNS)),
                (FailoverReason::Timeout, owned(TIMEOUT_PATTERNS)),
                (FailoverReason::Billing, owned(BILLING_PATTERNS)),
            ],
        }
    }

    /// Add extra keywords for a reason, keeping the precedence order.
    #[must_use]
    pub fn with_patterns(mut self, reason: FailoverReason, patterns: &[&str]) -> Self {
        if let Some((_, existing)) = self.categories.iter_mut().find(|(r, _)| *r == reason) {
            existing.extend(patterns.iter().map(|p| p.to_lowercase()));
        }
        self
    }

    /// Classify a raw message.
    pub fn classify_message(&self, message: &str) -> FailoverReason {
        let message = message.to_lowercase();
        self.categories
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| message.contains(p.as_str())))
            .map_or(FailoverReason::Unknown, |(reason, _)| *reason)
    }
}

fn owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| (*p).to_string()).collect()
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, err: Option<&dyn fmt::Display>) -> FailoverReason {
        err.map_or(FailoverReason::Unknown, |e| {
            self.classify_message(&e.to_string())
        })
    }
}

//! `subrun` Core Library
//!
//! Shared functionality for subagent orchestration:
//! - Role names and failover classification
//! - `.agents/` documents (tool servers, skills)
//! - Permission rule matching engine
//! - NDJSON parsing for the engine's stream-json protocol
//! - Settings hierarchy and tracing setup

pub mod agents;
pub mod config;
pub mod error;
pub mod failover;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ndjson;
pub mod permissions;
pub mod role;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use failover::{ErrorClassifier, FailoverReason, KeywordClassifier};
pub use permissions::{PermissionAction, PermissionEngine, PermissionRule};

//! subrun Daemon Library
//!
//! Core functionality for running subagents:
//! - Role concurrency pool for admission control
//! - Layered `.agents/` configuration resolution
//! - Permission bridge for mid-run tool approval
//! - Execution engines (engine CLI subprocess, failover)
//! - Run registry with spawn/wait/cancel

pub mod engine;
pub mod orchestration;
pub mod permission;
pub mod resolver;

//! NDJSON reader for the engine CLI's stream-json protocol.
//!
//! Parses newline-delimited JSON from the engine's stdout into the few
//! message kinds a subagent run reacts to, implementing a tolerant reader
//! pattern.

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;

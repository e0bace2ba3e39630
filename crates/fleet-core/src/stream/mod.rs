//! Stream parser for the wrapped agent's line-delimited JSON protocol.
//!
//! This module parses newline-delimited JSON from the agent's stdout into
//! canonical message types, implementing a tolerant reader pattern.

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;

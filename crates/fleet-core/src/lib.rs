//! `Fleet` Core Library
//!
//! Shared functionality for `Fleet` components:
//! - Stream parsing for the wrapped agent's line-delimited JSON protocol
//! - Configuration resolution and hierarchy
//! - Common error types
//! - Tracing initialization

pub mod config;
pub mod error;
pub mod stream;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};

//! Agent subprocess supervision.
//!
//! Spawning and observing the wrapped agent CLI: invocation building,
//! foreground runs with live stream parsing, detached background runs, and
//! the per-task deadline watchdog.

mod background;
mod foreground;
mod invocation;
pub mod watchdog;

pub use background::{BackgroundHandle, SpawnError, spawn_detached};
pub use foreground::{
    ForegroundParams, ProgressUpdate, RunError, RunReport, ToolOutput, format_duration_ms,
    format_tokens, run_foreground,
};
pub use invocation::{AgentInvocation, generate_task_id, sanitize_agent_name};

//! Fleet Daemon Library
//!
//! Core functionality for the fleet daemon:
//! - Admission control for agent spawns under a concurrency cap
//! - Subprocess supervision for foreground and background agent runs
//! - Durable task registry with crash recovery and age-based eviction
//! - Independent watchdog processes enforcing background deadlines
//! - Periodic reaper reconciling records against OS reality
//! - Bounded log tail reads
//!
//! The request transport (RPC, MCP, ...) is an external collaborator; it
//! attaches through [`orchestrator::Orchestrator`].

pub mod admission;
pub mod logs;
pub mod orchestrator;
pub mod process;
mod reaper;
pub mod registry;
pub mod supervisor;

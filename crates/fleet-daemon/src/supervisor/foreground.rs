//! Foreground (synchronous) agent runs.
//!
//! Spawns the agent with piped stdio, folds its line-delimited JSON stream
//! into progress updates and a final report, and enforces the caller's
//! wall-clock timeout with the shared SIGTERM -> grace -> SIGKILL
//! escalation. Malformed stream lines are dropped silently; the feed may be
//! chunked at arbitrary boundaries.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use fleet_core::stream::{self, ContentBlock, Message, RunResult, Usage};

use crate::process::escalate;

use super::invocation::AgentInvocation;

/// Progress notification emitted while a foreground run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Monotonic tool-use count at the time of the update.
    pub progress: u64,
    pub message: String,
}

/// Captured output of one tool invocation, keyed by tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub tool: String,
    pub output: String,
}

/// Final report of a foreground run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Inverse of the agent's error flag; `true` for the degenerate
    /// no-result exit-0 case.
    pub success: bool,
    pub result: String,
    pub usage: Option<Usage>,
    pub tool_use_count: u64,
    pub duration_ms: u64,
    /// Input + output + cache read + cache creation tokens.
    pub total_tokens: u64,
    pub tool_outputs: Vec<ToolOutput>,
}

/// Errors from a foreground run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to spawn agent: {reason}")]
    Spawn { reason: String },

    #[error("Agent timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("{message}")]
    Process { message: String },
}

/// Parameters for one foreground run.
pub struct ForegroundParams<'a> {
    pub agent_bin: &'a Path,
    pub invocation: &'a AgentInvocation,
    pub working_dir: &'a Path,
    pub timeout: Duration,
    pub term_grace: Duration,
    pub progress: Option<mpsc::Sender<ProgressUpdate>>,
    /// Shared map of in-flight foreground pids, for shutdown teardown.
    pub active: Arc<Mutex<HashMap<String, u32>>>,
    pub run_id: String,
}

/// Stream-folding state for one run.
#[derive(Debug, Default)]
struct ProgressState {
    tool_use_count: u64,
    current_tool: Option<String>,
    tool_outputs: Vec<ToolOutput>,
    final_result: Option<RunResult>,
}

impl ProgressState {
    fn observe(&mut self, msg: &Message) -> Vec<ProgressUpdate> {
        // Once the terminal result has arrived, later lines are noise.
        if self.final_result.is_some() {
            return Vec::new();
        }
        match msg {
            Message::SystemInit(init) => {
                let id: String = init.session_id.chars().take(8).collect();
                vec![ProgressUpdate {
                    progress: 0,
                    message: format!("Session initialized ({id}...)"),
                }]
            }
            Message::Assistant(assistant) => {
                let mut updates = Vec::new();
                for block in &assistant.content {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            self.tool_use_count += 1;
                            self.current_tool = Some(name.clone());
                            let input_preview = preview(
                                &serde_json::to_string(input).unwrap_or_default(),
                                50,
                            );
                            updates.push(ProgressUpdate {
                                progress: self.tool_use_count,
                                message: format!("Tool: {name} ({input_preview})"),
                            });
                        }
                        ContentBlock::Text { text } => {
                            updates.push(ProgressUpdate {
                                progress: self.tool_use_count,
                                message: format!("Response: {}", preview(text, 100)),
                            });
                        }
                    }
                }
                updates
            }
            Message::ToolOutcome(outcome) => {
                if !outcome.stdout.is_empty()
                    && let Some(tool) = &self.current_tool
                {
                    self.tool_outputs.push(ToolOutput {
                        tool: tool.clone(),
                        output: outcome.stdout.clone(),
                    });
                }
                let result_preview = if outcome.stdout.is_empty() {
                    "(no output)".to_string()
                } else {
                    preview(&outcome.stdout, 50)
                };
                vec![ProgressUpdate {
                    progress: self.tool_use_count,
                    message: format!("Result: {result_preview}"),
                }]
            }
            Message::RunResult(result) => {
                self.final_result = Some(result.clone());
                Vec::new()
            }
            Message::Unknown { .. } => Vec::new(),
        }
    }
}

/// Truncate to `max` characters, appending an ellipsis when shortened.
fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

/// Human-readable token count (`950`, `1.2k`, `1.5M`).
#[allow(clippy::cast_precision_loss)]
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Human-readable duration (`850ms`, `42s`).
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{}s", ms / 1000)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis_u64(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Run an agent to completion in the foreground.
#[allow(clippy::too_many_lines)]
pub async fn run_foreground(params: ForegroundParams<'_>) -> Result<RunReport, RunError> {
    let ForegroundParams {
        agent_bin,
        invocation,
        working_dir,
        timeout,
        term_grace,
        progress,
        active,
        run_id,
    } = params;

    let mut cmd = Command::new(agent_bin);
    cmd.args(invocation.to_args(true))
        .current_dir(working_dir)
        // The agent takes its prompt from argv; it never reads stdin.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| RunError::Spawn {
        reason: e.to_string(),
    })?;
    let pid = child.id();
    let started = tokio::time::Instant::now();

    if let Some(pid) = pid {
        active.lock().await.insert(run_id.clone(), pid);
        debug!(run_id = %run_id, pid, "Foreground agent spawned");
    }

    let stdout = child.stdout.take().ok_or_else(|| RunError::Spawn {
        reason: "Failed to capture stdout".to_string(),
    })?;

    // Collect stderr for the failure message.
    let stderr_handle = child.stderr.take().map(|stderr| {
        let run_id = run_id.clone();
        tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(run_id = %run_id, "stderr: {}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        })
    });

    let mut state = ProgressState::default();
    let drive = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(msg) = stream::parse_line(&line) else {
                continue;
            };
            for update in state.observe(&msg) {
                if let Some(tx) = &progress {
                    let _ = tx.send(update).await;
                }
            }
        }
    };

    let mut timed_out = tokio::time::timeout(timeout, drive).await.is_err();
    if timed_out && let Some(pid) = pid {
        warn!(run_id = %run_id, pid, timeout_ms = millis_u64(timeout), "Foreground agent timed out");
        escalate(pid, term_grace);
    }

    // The stream can end while the process lingers; the wait stays bounded
    // by whatever is left of the caller's timeout.
    let status = if timed_out {
        child.wait().await
    } else {
        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                timed_out = true;
                if let Some(pid) = pid {
                    escalate(pid, term_grace);
                }
                child.wait().await
            }
        }
    };

    active.lock().await.remove(&run_id);

    let stderr_text = match stderr_handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    let duration_ms = millis_u64(started.elapsed());

    if timed_out {
        return Err(RunError::TimedOut {
            timeout_ms: millis_u64(timeout),
        });
    }

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Failed to await agent exit");
            None
        }
    };

    if let Some(result) = state.final_result {
        let total_tokens = result.usage.total_tokens();
        if let Some(tx) = &progress {
            let cost = result
                .total_cost_usd
                .map_or_else(|| "?".to_string(), |c| format!("{c:.4}"));
            let _ = tx
                .send(ProgressUpdate {
                    progress: state.tool_use_count,
                    message: format!(
                        "Done ({} tool uses, {} tokens, {}, ${cost})",
                        state.tool_use_count,
                        format_tokens(total_tokens),
                        format_duration_ms(duration_ms),
                    ),
                })
                .await;
        }
        return Ok(RunReport {
            success: !result.is_error,
            result: result.result,
            usage: Some(result.usage),
            tool_use_count: state.tool_use_count,
            duration_ms,
            total_tokens,
            tool_outputs: state.tool_outputs,
        });
    }

    if exit_code == Some(0) {
        // The agent exited cleanly without ever emitting a result event.
        return Ok(RunReport {
            success: true,
            result: String::new(),
            usage: None,
            tool_use_count: state.tool_use_count,
            duration_ms,
            total_tokens: 0,
            tool_outputs: state.tool_outputs,
        });
    }

    let message = if stderr_text.trim().is_empty() {
        exit_code.map_or_else(
            || "Agent terminated by signal".to_string(),
            |code| format!("Agent exited with code {code}"),
        )
    } else {
        stderr_text.trim().to_string()
    };
    Err(RunError::Process { message })
}

//! Message types for the agent's line-delimited stream protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical message types emitted on the agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    ToolOutcome(ToolOutcome),
    RunResult(RunResult),
    Unknown { msg_type: String, payload: Value },
}

/// Session initialization message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
}

/// Complete assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

/// Content block in an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
}

/// Captured output of a tool execution, echoed back on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutcome {
    pub stdout: String,
    pub stderr: String,
    pub interrupted: bool,
}

/// Terminal run result.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub result: String,
    pub is_error: bool,
    pub duration_ms: u64,
    pub total_cost_usd: Option<f64>,
    pub usage: Usage,
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Total tokens across input, output, and both cache figures.
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

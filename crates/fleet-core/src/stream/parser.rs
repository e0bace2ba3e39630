//! Line parser for the agent stream protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! preserved. Callers drop parse errors silently because the feed may be
//! chunked at arbitrary boundaries.

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single line from the agent's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::StreamParse("Missing 'type' field".into()))?;

    match msg_type {
        "system" => parse_system(raw),
        "assistant" => parse_assistant(raw),
        "user" => parse_user(raw),
        "result" => parse_result(raw),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn parse_system(raw: &Value) -> Result<Message> {
    let session_id = raw
        .get("session_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Ok(Message::SystemInit(SystemInit { session_id }))
}

fn parse_assistant(raw: &Value) -> Result<Message> {
    let msg = raw.get("message").unwrap_or(raw);
    let content = parse_content_blocks(msg.get("content"));

    Ok(Message::Assistant(AssistantMessage { content }))
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    let Some(arr) = content.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| {
            let block_type = block.get("type")?.as_str()?;
            match block_type {
                "text" => {
                    let text = block.get("text")?.as_str()?.to_string();
                    Some(ContentBlock::Text { text })
                }
                "tool_use" => {
                    let name = block.get("name")?.as_str()?.to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    Some(ContentBlock::ToolUse { name, input })
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_user(raw: &Value) -> Result<Message> {
    let outcome = raw
        .get("tool_use_result")
        .map(|r| ToolOutcome {
            stdout: r
                .get("stdout")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            stderr: r
                .get("stderr")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            interrupted: r
                .get("interrupted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
        .unwrap_or_default();

    Ok(Message::ToolOutcome(outcome))
}

pub(crate) fn parse_usage(val: Option<&Value>) -> Usage {
    val.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn parse_result(raw: &Value) -> Result<Message> {
    let result = raw
        .get("result")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let is_error = raw
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let duration_ms = raw.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0);
    let total_cost_usd = raw.get("total_cost_usd").and_then(|v| v.as_f64());
    let usage = parse_usage(raw.get("usage"));

    Ok(Message::RunResult(RunResult {
        result,
        is_error,
        duration_ms,
        total_cost_usd,
        usage,
    }))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123"}"#;
        let msg = parse_line(json).unwrap();
        match msg {
            Message::SystemInit(init) => assert_eq!(init.session_id, "abc123"),
            other => panic!("expected SystemInit, got {other:?}"),
        }
    }

    #[test]
    fn parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let msg = parse_line(json).unwrap();
        let Message::Assistant(assistant) = msg else {
            panic!("expected Assistant");
        };
        assert_eq!(assistant.content.len(), 1);
        assert!(matches!(
            &assistant.content[0],
            ContentBlock::ToolUse { name, .. } if name == "Bash"
        ));
    }

    #[test]
    fn parse_assistant_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        let msg = parse_line(json).unwrap();
        let Message::Assistant(assistant) = msg else {
            panic!("expected Assistant");
        };
        assert!(matches!(
            &assistant.content[0],
            ContentBlock::Text { text } if text == "hello"
        ));
    }

    #[test]
    fn parse_tool_outcome() {
        let json = r#"{"type":"user","tool_use_result":{"stdout":"ok\n","stderr":"","interrupted":false}}"#;
        let msg = parse_line(json).unwrap();
        let Message::ToolOutcome(outcome) = msg else {
            panic!("expected ToolOutcome");
        };
        assert_eq!(outcome.stdout, "ok\n");
        assert!(!outcome.interrupted);
    }

    #[test]
    fn parse_final_result() {
        let json = r#"{"type":"result","result":"done","is_error":false,"duration_ms":1234,"total_cost_usd":0.05,"usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":10}}"#;
        let msg = parse_line(json).unwrap();
        let Message::RunResult(result) = msg else {
            panic!("expected RunResult");
        };
        assert_eq!(result.result, "done");
        assert!(!result.is_error);
        assert_eq!(result.duration_ms, 1234);
        assert_eq!(result.usage.total_tokens(), 160);
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        let json = r#"{"type":"system","session_id":"x","unknown":"ignored"}"#;
        assert!(parse_line(json).is_ok());
    }

    #[test]
    fn unknown_type_returns_unknown_message() {
        let json = r#"{"type":"future_type","data":"something"}"#;
        let msg = parse_line(json).unwrap();
        assert!(matches!(msg, Message::Unknown { .. }));
    }

    #[test]
    fn partial_line_is_an_error() {
        assert!(parse_line(r#"{"type":"assis"#).is_err());
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(parse_line(r#"{"session_id":"x"}"#).is_err());
    }

    #[test]
    fn user_without_tool_result_yields_empty_outcome() {
        let json = r#"{"type":"user"}"#;
        let msg = parse_line(json).unwrap();
        let Message::ToolOutcome(outcome) = msg else {
            panic!("expected ToolOutcome");
        };
        assert!(outcome.stdout.is_empty());
    }
}

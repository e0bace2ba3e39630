//! Agent CLI invocation building.
//!
//! Reproduces the wrapped executable's flag grammar so spawned agents
//! behave identically to a native invocation. The grammar is a static
//! translation of spawn options; only the streaming flags differ between
//! foreground and background runs.

use std::ffi::OsString;
use std::path::PathBuf;

/// Maximum length of a sanitized agent name.
const AGENT_NAME_MAX_LEN: usize = 64;

/// Options forwarded to the wrapped agent CLI.
#[derive(Debug, Clone, Default)]
pub struct AgentInvocation {
    /// Task prompt (`-p`).
    pub prompt: String,
    /// Model selection (`--model`).
    pub model: Option<String>,
    /// Bypass all permission checks (`--dangerously-skip-permissions`).
    /// Takes precedence over `permission_mode`.
    pub skip_permissions: bool,
    /// Permission mode (`--permission-mode`).
    pub permission_mode: Option<String>,
    /// Full system prompt override (`--system-prompt`).
    pub system_prompt: Option<String>,
    /// Appended system prompt (`--append-system-prompt`).
    pub append_system_prompt: Option<String>,
    /// Pre-approved tools (`--allowed-tools`).
    pub allowed_tools: Vec<String>,
    /// Blocked tools (`--disallowed-tools`).
    pub disallowed_tools: Vec<String>,
    /// API budget ceiling in USD (`--max-budget-usd`).
    pub max_budget_usd: Option<f64>,
    /// Additional accessible directories (`--add-dir`).
    pub add_dirs: Vec<PathBuf>,
    /// Plugin directory passthrough (`--plugin-dir`), so spawned agents can
    /// themselves reach the same extensions.
    pub plugin_dir: Option<PathBuf>,
}

impl AgentInvocation {
    /// Build the CLI argument list.
    ///
    /// `streaming` selects the line-delimited JSON output used by
    /// foreground runs; background runs keep the default output and log it
    /// to a file instead.
    pub fn to_args(&self, streaming: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-p".into(), self.prompt.clone().into()];

        if streaming {
            args.push("--output-format".into());
            args.push("stream-json".into());
            args.push("--verbose".into());
        }

        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone().into());
        }

        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".into());
        } else if let Some(mode) = &self.permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.clone().into());
        }

        if let Some(prompt) = &self.system_prompt {
            args.push("--system-prompt".into());
            args.push(prompt.clone().into());
        }
        if let Some(prompt) = &self.append_system_prompt {
            args.push("--append-system-prompt".into());
            args.push(prompt.clone().into());
        }

        if !self.allowed_tools.is_empty() {
            args.push("--allowed-tools".into());
            args.extend(self.allowed_tools.iter().map(|t| t.clone().into()));
        }
        if !self.disallowed_tools.is_empty() {
            args.push("--disallowed-tools".into());
            args.extend(self.disallowed_tools.iter().map(|t| t.clone().into()));
        }

        if let Some(budget) = self.max_budget_usd {
            args.push("--max-budget-usd".into());
            args.push(budget.to_string().into());
        }

        for dir in &self.add_dirs {
            args.push("--add-dir".into());
            args.push(dir.clone().into());
        }

        // Spawned agents are one-shot; their sessions are not resumable.
        args.push("--no-session-persistence".into());

        if let Some(dir) = &self.plugin_dir {
            args.push("--plugin-dir".into());
            args.push(dir.clone().into());
        }

        args
    }
}

/// Sanitize a caller-supplied agent name for use in task ids, file paths,
/// and the watchdog script. Anything outside `[A-Za-z0-9_-]` becomes `_`,
/// and the result is bounded in length.
pub fn sanitize_agent_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(AGENT_NAME_MAX_LEN)
        .collect();

    if sanitized.is_empty() {
        "agent".to_string()
    } else {
        sanitized
    }
}

/// Generate a task id from the sanitized agent name, start timestamp, and a
/// random suffix.
pub fn generate_task_id(agent_name: &str, start_ms: i64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{agent_name}-{start_ms}-{}", &suffix[..6])
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args_as_strings(invocation: &AgentInvocation, streaming: bool) -> Vec<String> {
        invocation
            .to_args(streaming)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn minimal_invocation_carries_prompt_and_session_opt_out() {
        let invocation = AgentInvocation {
            prompt: "do the thing".to_string(),
            ..Default::default()
        };
        let args = args_as_strings(&invocation, false);
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "do the thing");
        assert!(args.contains(&"--no-session-persistence".to_string()));
        assert!(!args.contains(&"--output-format".to_string()));
    }

    #[test]
    fn streaming_adds_stream_json_and_verbose() {
        let invocation = AgentInvocation {
            prompt: "p".to_string(),
            ..Default::default()
        };
        let args = args_as_strings(&invocation, true);
        let pos = args.iter().position(|a| a == "--output-format").unwrap();
        assert_eq!(args[pos + 1], "stream-json");
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn skip_permissions_wins_over_permission_mode() {
        let invocation = AgentInvocation {
            prompt: "p".to_string(),
            skip_permissions: true,
            permission_mode: Some("plan".to_string()),
            ..Default::default()
        };
        let args = args_as_strings(&invocation, false);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));
    }

    #[test]
    fn tool_lists_expand_inline() {
        let invocation = AgentInvocation {
            prompt: "p".to_string(),
            allowed_tools: vec!["Bash".to_string(), "Read".to_string()],
            disallowed_tools: vec!["WebSearch".to_string()],
            ..Default::default()
        };
        let args = args_as_strings(&invocation, false);
        let pos = args.iter().position(|a| a == "--allowed-tools").unwrap();
        assert_eq!(&args[pos + 1..pos + 3], ["Bash", "Read"]);
        let pos = args.iter().position(|a| a == "--disallowed-tools").unwrap();
        assert_eq!(args[pos + 1], "WebSearch");
    }

    #[test]
    fn budget_add_dirs_and_plugin_dir_round_trip() {
        let invocation = AgentInvocation {
            prompt: "p".to_string(),
            max_budget_usd: Some(2.5),
            add_dirs: vec![PathBuf::from("/data"), PathBuf::from("/scratch")],
            plugin_dir: Some(PathBuf::from("/plugins")),
            ..Default::default()
        };
        let args = args_as_strings(&invocation, false);
        let pos = args.iter().position(|a| a == "--max-budget-usd").unwrap();
        assert_eq!(args[pos + 1], "2.5");
        assert_eq!(args.iter().filter(|a| *a == "--add-dir").count(), 2);
        let pos = args.iter().position(|a| a == "--plugin-dir").unwrap();
        assert_eq!(args[pos + 1], "/plugins");
    }

    #[test]
    fn sanitize_replaces_shell_metacharacters() {
        assert_eq!(sanitize_agent_name("alex"), "alex");
        assert_eq!(sanitize_agent_name("a b;rm -rf /"), "a_b_rm_-rf__");
        assert_eq!(sanitize_agent_name("$(whoami)"), "__whoami_");
    }

    #[test]
    fn sanitize_bounds_length_and_never_returns_empty() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_agent_name(&long).len(), 64);
        assert_eq!(sanitize_agent_name(""), "agent");
    }

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = generate_task_id("alex", 1700000000000);
        let b = generate_task_id("alex", 1700000000000);
        assert!(a.starts_with("alex-1700000000000-"));
        assert_ne!(a, b);
    }
}

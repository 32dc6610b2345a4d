//! Prompt Builder (spec §4.7): a deterministic function of (workspace home,
//! tool names) producing the system prompt text. Grounded on
//! `crates/gateway/src/runtime/mod.rs::build_system_context` (workspace file
//! read, optional sections) and `crates/contextpack/src/truncation.rs`
//! (byte-budget truncation with a marker).

mod truncation;

pub use truncation::{truncate_head_tail, truncate_per_file};

use std::path::Path;

use sa_domain::config::PromptConfig;
use sa_domain::error::Result;

const DEFAULT_TEMPLATE: &str = "\
You are an agent running inside a multi-agent task runtime.

You communicate by pushing events onto shared streams and by spawning \
tasks. Use the tools available to you to send messages, spawn and await \
tasks, and control your own task lifecycle.

## Tools

{{TOOLS}}
";

const HEAD_FRAC: f64 = 0.7;
const TAIL_FRAC: f64 = 0.2;

/// Builds the system prompt text. Identical `(cfg, tool_names)` and
/// identical on-disk template/memory contents always yield byte-identical
/// output — required for prompt-cache stability (§9).
pub fn build_system_prompt(cfg: &PromptConfig, tool_names: &[String]) -> Result<String> {
    let template = read_template(&cfg.workspace_path, &cfg.template_filename);
    let tools_section = render_tools_section(tool_names);
    let mut prompt = template.replace("{{TOOLS}}", &tools_section);

    if let Some(memory_section) = read_memory_section(&cfg.workspace_path, &cfg.memory_filename, cfg.memory_budget_bytes) {
        prompt.push_str("\n\n## Workspace Context\n\n");
        prompt.push_str(&memory_section);
    }

    Ok(prompt)
}

fn read_template(workspace: &Path, filename: &str) -> String {
    std::fs::read_to_string(workspace.join(filename)).unwrap_or_else(|_| DEFAULT_TEMPLATE.to_string())
}

fn render_tools_section(tool_names: &[String]) -> String {
    if tool_names.is_empty() {
        return "(none)".to_string();
    }
    tool_names.iter().map(|n| format!("- `{n}`")).collect::<Vec<_>>().join("\n")
}

fn read_memory_section(workspace: &Path, filename: &str, budget_bytes: usize) -> Option<String> {
    let content = std::fs::read_to_string(workspace.join(filename)).ok()?;
    if content.trim().is_empty() {
        return None;
    }
    let (truncated, _) = truncate_head_tail(&content, budget_bytes, HEAD_FRAC, TAIL_FRAC);
    Some(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::config::PromptConfig;

    fn cfg(workspace: &Path) -> PromptConfig {
        PromptConfig {
            workspace_path: workspace.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn falls_back_to_embedded_default_template() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = build_system_prompt(&cfg(dir.path()), &["noop".to_string()]).unwrap();
        assert!(prompt.contains("multi-agent task runtime"));
        assert!(prompt.contains("- `noop`"));
    }

    #[test]
    fn reads_declarative_template_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SYSTEM_PROMPT.md"), "Custom prompt: {{TOOLS}}").unwrap();
        let prompt = build_system_prompt(&cfg(dir.path()), &["exec".to_string()]).unwrap();
        assert_eq!(prompt, "Custom prompt: - `exec`");
    }

    #[test]
    fn appends_workspace_context_from_memory_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "the user prefers terse replies").unwrap();
        let prompt = build_system_prompt(&cfg(dir.path()), &[]).unwrap();
        assert!(prompt.contains("## Workspace Context"));
        assert!(prompt.contains("the user prefers terse replies"));
    }

    #[test]
    fn omits_workspace_context_when_memory_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = build_system_prompt(&cfg(dir.path()), &[]).unwrap();
        assert!(!prompt.contains("## Workspace Context"));
    }

    #[test]
    fn is_idempotent_for_identical_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "stable memory content").unwrap();
        let a = build_system_prompt(&cfg(dir.path()), &["noop".to_string()]).unwrap();
        let b = build_system_prompt(&cfg(dir.path()), &["noop".to_string()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn truncates_oversized_memory_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let big = "x".repeat(20_000);
        std::fs::write(dir.path().join("MEMORY.md"), &big).unwrap();
        let mut c = cfg(dir.path());
        c.memory_budget_bytes = 100;
        let prompt = build_system_prompt(&c, &[]).unwrap();
        assert!(prompt.contains("TRUNCATED"));
    }
}

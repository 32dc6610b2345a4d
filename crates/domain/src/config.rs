use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Config {
    pub fn load_or_default(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse config, using defaults");
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }

    /// Mirrors the teacher's `validate()` → `Vec<ConfigIssue>` pattern.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.store.busy_timeout_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "store.busy_timeout_ms".to_string(),
                message: "busy_timeout_ms is 0; store writes under contention will fail fast instead of retrying".to_string(),
            });
        }

        if self.event_bus.subscriber_buffer < 64 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "event_bus.subscriber_buffer".to_string(),
                message: format!(
                    "subscriber_buffer must be >= 64 per spec, got {}",
                    self.event_bus.subscriber_buffer
                ),
            });
        }

        if self.runtime.context_window_n == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "runtime.context_window_n".to_string(),
                message: "context_window_n must be > 0".to_string(),
            });
        }

        if self.tasks.staleness_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "tasks.staleness_secs".to_string(),
                message: "staleness_secs is 0; the health monitor will treat every exec task as stale immediately".to_string(),
            });
        }

        if self.compaction.auto && self.compaction.max_turns == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "compaction.max_turns".to_string(),
                message: "max_turns is 0 with auto compaction enabled; every turn will compact".to_string(),
            });
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

impl std::fmt::Display for ConfigSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSeverity::Warning => write!(f, "WARN"),
            ConfigSeverity::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "d_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Retries for task-update writes under `Busy` before surfacing
    /// `llm_update_error` (§7).
    #[serde(default = "d_busy_retries")]
    pub busy_retries: u32,
    #[serde(default = "d_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
}

fn d_db_path() -> PathBuf {
    PathBuf::from("kernel.db")
}
fn d_busy_timeout_ms() -> u64 {
    5_000
}
fn d_busy_retries() -> u32 {
    3
}
fn d_busy_backoff_ms() -> u64 {
    25
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
            busy_timeout_ms: d_busy_timeout_ms(),
            busy_retries: d_busy_retries(),
            busy_backoff_ms: d_busy_backoff_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Bounded per-subscriber buffer; slow subscribers are dropped, never
    /// block the pusher (§4.1).
    #[serde(default = "d_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn d_subscriber_buffer() -> usize {
    64
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: d_subscriber_buffer(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tasks / health monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "d_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "d_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "d_wake_cooldown_secs")]
    pub wake_cooldown_secs: u64,
}

fn d_health_interval_secs() -> u64 {
    30
}
fn d_staleness_secs() -> u64 {
    30
}
fn d_wake_cooldown_secs() -> u64 {
    30
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: d_health_interval_secs(),
            staleness_secs: d_staleness_secs(),
            wake_cooldown_secs: d_wake_cooldown_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// N in §4.4 step 6 — at most N context events kept per turn frame.
    #[serde(default = "d_context_window_n")]
    pub context_window_n: usize,
    /// Loop tick when no wake events are pending (§4.3 step 3), millis.
    #[serde(default = "d_loop_tick_ms")]
    pub loop_tick_ms: u64,
    #[serde(default = "d_max_tool_loops")]
    pub max_tool_loops: usize,
}

fn d_context_window_n() -> usize {
    24
}
fn d_loop_tick_ms() -> u64 {
    500
}
fn d_max_tool_loops() -> usize {
    25
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_window_n: d_context_window_n(),
            loop_tick_ms: d_loop_tick_ms(),
            max_tool_loops: d_max_tool_loops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "d_workspace_path")]
    pub workspace_path: PathBuf,
    #[serde(default = "d_template_filename")]
    pub template_filename: String,
    #[serde(default = "d_memory_filename")]
    pub memory_filename: String,
    /// Byte budget for the workspace-context section (§4.7).
    #[serde(default = "d_memory_budget_bytes")]
    pub memory_budget_bytes: usize,
}

fn d_workspace_path() -> PathBuf {
    PathBuf::from("workspace")
}
fn d_template_filename() -> String {
    "SYSTEM_PROMPT.md".to_string()
}
fn d_memory_filename() -> String {
    "MEMORY.md".to_string()
}
fn d_memory_budget_bytes() -> usize {
    8_000
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            workspace_path: d_workspace_path(),
            template_filename: d_template_filename(),
            memory_filename: d_memory_filename(),
            memory_budget_bytes: d_memory_budget_bytes(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agents — which agent ids `sa-kernel` spawns a loop for. Grounded on the
// teacher's `config.agents: HashMap<String, AgentConfig>`, simplified to a
// bare id list since per-agent persona overrides (model, tool allowlist)
// are out of scope here.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "d_agent_ids")]
    pub ids: Vec<String>,
}

fn d_agent_ids() -> Vec<String> {
    vec!["operator".to_string()]
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self { ids: d_agent_ids() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction — §4.4's `CompactAgentContext` trigger. Grounded on the
// teacher's `config::compaction::CompactionConfig`, dropped its
// `MemoryLifecycleConfig` sibling since long-term memory capture has no
// counterpart here.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Enable automatic compaction once a generation's turn count passes
    /// `max_turns`.
    #[serde(default = "d_true")]
    pub auto: bool,
    /// Turns (`user_message` entries) a generation may hold before the
    /// next successful turn triggers compaction.
    #[serde(default = "d_max_turns")]
    pub max_turns: usize,
}

fn d_true() -> bool {
    true
}
fn d_max_turns() -> usize {
    80
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self { auto: d_true(), max_turns: d_max_turns() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(issues.iter().all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn small_subscriber_buffer_is_an_error() {
        let mut cfg = Config::default();
        cfg.event_bus.subscriber_buffer = 4;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "event_bus.subscriber_buffer"));
    }

    #[test]
    fn roundtrips_through_toml() {
        let cfg = Config::default();
        let s = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.runtime.context_window_n, cfg.runtime.context_window_n);
    }
}

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::new_sortable_id;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Priority
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Total order over wake urgency. Unknown values coerce to `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Interrupt = 0,
    Wake = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Only `interrupt` and `wake` preempt an idle wait.
    pub fn is_preempting(self) -> bool {
        matches!(self, Priority::Interrupt | Priority::Wake)
    }

    pub fn parse(s: &str) -> Priority {
        match s {
            "interrupt" => Priority::Interrupt,
            "wake" => Priority::Wake,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Interrupt => "interrupt",
            Priority::Wake => "wake",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const STREAM_TASK_INPUT: &str = "task_input";
pub const STREAM_TASK_OUTPUT: &str = "task_output";
pub const STREAM_SIGNALS: &str = "signals";
pub const STREAM_ERRORS: &str = "errors";
pub const STREAM_EXTERNAL: &str = "external";
pub const STREAM_HISTORY: &str = "history";

/// Closed set of reserved streams vs. app-defined ones. `task_input` is the
/// only FIFO stream; everything else is LIFO when listed (§3).
pub fn is_fifo_stream(stream: &str) -> bool {
    stream == STREAM_TASK_INPUT
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Task,
    Agent,
}

impl ScopeType {
    pub fn parse(s: &str) -> ScopeType {
        match s {
            "task" => ScopeType::Task,
            "agent" => ScopeType::Agent,
            _ => ScopeType::Global,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Task => "task",
            ScopeType::Agent => "agent",
        }
    }
}

impl Default for ScopeType {
    fn default() -> Self {
        ScopeType::Global
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable record appended to exactly one stream. Once appended, only
/// `read_by` may change, and only by growing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub stream: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub read_by: HashSet<String>,
}

impl Event {
    pub fn priority(&self) -> Priority {
        self.metadata
            .get("priority")
            .and_then(|v| v.as_str())
            .map(Priority::parse)
            .unwrap_or_default()
    }

    pub fn kind(&self) -> Option<&str> {
        self.metadata.get("kind").and_then(|v| v.as_str())
    }

    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get("task_id").and_then(|v| v.as_str())
    }

    pub fn action(&self) -> Option<&str> {
        self.metadata.get("action").and_then(|v| v.as_str())
    }

    /// An event "targets" a reader when it's global, or scoped to that
    /// exact task/agent id (§4.3).
    pub fn targets(&self, reader: &str) -> bool {
        match self.scope_type {
            ScopeType::Global => true,
            ScopeType::Task | ScopeType::Agent => self.scope_id == reader,
        }
    }

    pub fn is_read_by(&self, reader: &str) -> bool {
        self.read_by.contains(reader)
    }
}

/// Parameters for pushing a new event (§4.1 `push`).
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub stream: String,
    pub scope_type: Option<ScopeType>,
    pub scope_id: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub payload: HashMap<String, serde_json::Value>,
    /// When set, `read_by` is born containing this id (self-echo prevention).
    pub source_id: Option<String>,
}

impl NewEvent {
    pub fn into_event(self) -> Event {
        let mut read_by = HashSet::new();
        if let Some(source) = &self.source_id {
            read_by.insert(source.clone());
        }
        Event {
            id: new_sortable_id(),
            stream: self.stream,
            scope_type: self.scope_type.unwrap_or_default(),
            scope_id: self.scope_id.unwrap_or_else(|| "*".to_string()),
            subject: self.subject,
            body: self.body,
            metadata: self.metadata,
            payload: self.payload,
            created_at: Utc::now(),
            read_by,
        }
    }
}

/// Lightweight projection returned by `list` (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub stream: String,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Killed
        )
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        Some(match s {
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "killed" => TaskStatus::Killed,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Killed => "killed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Sync,
    Async,
}

impl Default for TaskMode {
    fn default() -> Self {
        TaskMode::Async
    }
}

/// The three privileged task types; anything else is caller-defined.
pub mod task_type {
    pub const AGENT: &str = "agent";
    pub const LLM: &str = "llm";
    pub const EXEC: &str = "exec";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub owner: String,
    pub parent_id: Option<String>,
    pub mode: TaskMode,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for spawning a task (§4.2 `spawn`).
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_type: String,
    pub owner: String,
    pub parent_id: Option<String>,
    pub mode: TaskMode,
    pub payload: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Append-only child record capturing a task's streaming progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: String,
    pub task_id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub mod update_kind {
    pub const SPAWN: &str = "spawn";
    pub const STARTED: &str = "started";
    pub const INPUT: &str = "input";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const PROGRESS: &str = "progress";
    pub const LLM_TEXT: &str = "llm_text";
    pub const LLM_MESSAGE_START: &str = "llm_message_start";
    pub const LLM_THINKING: &str = "llm_thinking";
    pub const LLM_THINKING_DONE: &str = "llm_thinking_done";
    pub const LLM_TOOL_START: &str = "llm_tool_start";
    pub const LLM_TOOL_DELTA: &str = "llm_tool_delta";
    pub const LLM_TOOL_DONE: &str = "llm_tool_done";
    pub const LLM_TOOL_STATUS: &str = "llm_tool_status";
    pub const LLM_IMAGE: &str = "llm_image";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
    pub const KILLED: &str = "killed";
    pub const AWAIT_TIMEOUT: &str = "await_timeout";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEntryType {
    ToolsConfig,
    SystemPrompt,
    UserMessage,
    AssistantMessage,
    Reasoning,
    ToolCall,
    ToolStatus,
    ToolResult,
    ContextEvent,
    SystemUpdate,
    LlmInput,
    Wake,
    Error,
    ContextCompaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub agent_id: String,
    pub generation: u64,
    #[serde(rename = "type")]
    pub entry_type: HistoryEntryType,
    pub role: Option<String>,
    pub content: String,
    pub task_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_status: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a history entry.
#[derive(Debug, Clone, Default)]
pub struct NewHistoryEntry {
    pub agent_id: String,
    pub generation: u64,
    pub entry_type: Option<HistoryEntryType>,
    pub role: Option<String>,
    pub content: String,
    pub task_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_status: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl Default for HistoryEntryType {
    fn default() -> Self {
        HistoryEntryType::SystemUpdate
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Advisory in-memory projection per agent. Canonical truth is the
/// history log; this exists only for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    pub task_id: String,
    pub llm_task_id: Option<String>,
    pub prompt: Option<String>,
    pub last_input: Option<String>,
    pub last_output: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

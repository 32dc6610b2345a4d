use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
///
/// A lazy, finite, non-restartable sequence delivered in arrival order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart,

    #[serde(rename = "token")]
    Token { text: String },

    #[serde(rename = "thinking")]
    Thinking { text: String },

    #[serde(rename = "thinking_done")]
    ThinkingDone,

    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "tool_status")]
    ToolStatus { call_id: String, status: String },

    #[serde(rename = "image")]
    Image { url: String },

    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

//! A scriptable `LlmProvider` for integration tests (`sa-runtime`'s S1–S7
//! scenarios). Each call to `chat_stream` pops the next queued script and
//! replays it; `chat` concatenates the `Token` text of the next script into
//! a single response. No network, no provider adapters — a test double.

use std::collections::VecDeque;

use parking_lot::Mutex;
use sa_domain::error::{Error, Result};
use sa_domain::stream::{BoxStream, StreamEvent};
use sa_domain::tool::ToolCall;

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

/// One scripted turn. `Pending` never resolves — used to model a turn an
/// interrupt or cancellation must cut off mid-flight.
pub enum Script {
    Events(Vec<StreamEvent>),
    Pending,
}

impl Script {
    pub fn text(text: impl Into<String>) -> Self {
        Script::Events(vec![
            StreamEvent::MessageStart,
            StreamEvent::Token { text: text.into() },
            StreamEvent::Done { usage: None, finish_reason: Some("stop".to_string()) },
        ])
    }

    pub fn tool_call(call_id: impl Into<String>, tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let call_id = call_id.into();
        Script::Events(vec![
            StreamEvent::MessageStart,
            StreamEvent::ToolCallStarted { call_id: call_id.clone(), tool_name: tool_name.clone().into() },
            StreamEvent::ToolCallFinished { call_id, tool_name: tool_name.into(), arguments },
            StreamEvent::Done { usage: None, finish_reason: Some("tool_calls".to_string()) },
        ])
    }
}

pub struct StubProvider {
    id: String,
    scripts: Mutex<VecDeque<Script>>,
}

impl StubProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), scripts: Mutex::new(VecDeque::new()) }
    }

    /// Queues a script to be replayed by the next `chat`/`chat_stream` call.
    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    fn next_script(&self) -> Script {
        self.scripts.lock().pop_front().unwrap_or_else(|| Script::text("ok"))
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        let events = match self.next_script() {
            Script::Events(events) => events,
            Script::Pending => std::future::pending::<()>().await,
        };

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;
        for event in events {
            match event {
                StreamEvent::Token { text } => content.push_str(&text),
                StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                    tool_calls.push(ToolCall { call_id, tool_name, arguments });
                }
                StreamEvent::Done { usage: u, finish_reason: f } => {
                    usage = u;
                    finish_reason = f;
                }
                StreamEvent::Error { message } => {
                    return Err(Error::Provider { provider: self.id.clone(), message });
                }
                _ => {}
            }
        }

        Ok(ChatResponse { content, tool_calls, usage, model: self.id.clone(), finish_reason })
    }

    async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let script = self.next_script();
        let stream = async_stream::stream! {
            match script {
                Script::Events(events) => {
                    for event in events {
                        yield Ok(event);
                    }
                }
                Script::Pending => {
                    std::future::pending::<()>().await;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

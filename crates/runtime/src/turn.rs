//! Turn executor: `HandleMessage` (spec §4.4). Builds the LLM input,
//! drives the provider stream, dispatches tool calls, and records every
//! step to the history log and task manager. Grounded on
//! `crates/gateway/src/runtime/mod.rs::handle_message`'s overall shape
//! (system-prompt reuse, transcript reconstruction, streaming tool loop),
//! adapted from a single-process session to the event-bus-driven model.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use sa_domain::error::{Error, Result};
use sa_domain::model::{
    task_type, update_kind, HistoryEntryType, NewHistoryEntry, NewTask, Priority, ScopeType,
    TaskMode, STREAM_ERRORS, STREAM_SIGNALS,
};
use sa_domain::model::NewEvent;
use sa_domain::stream::StreamEvent;
use sa_domain::tool::{ContentPart, Message, MessageContent, Role};
use sa_domain::trace::TraceEvent;
use sa_providers::ChatRequest;
use sa_tools::agent_tools::{IgnoredWakeIds, ToolContext};
use tokio_util::sync::CancellationToken;

use crate::context::{
    collect_unread_context_events, compute_turn_context, context_item_history_entry,
    project_context_events, render_envelope, system_update_entry,
};
use crate::watchers::{command_watcher, interrupt_watcher};
use crate::RuntimeContext;

const TOOL_RESULT_CLIP: usize = 1200;

pub struct TriggerMeta {
    pub event_id: String,
    pub stream: String,
    pub priority: Priority,
    pub request_id: String,
}

pub enum TurnOutcome {
    Completed { output: String },
    Cancelled,
    Failed { error: String },
}

fn classify_error(e: &Error) -> TurnOutcome {
    if e.is_cancellation() {
        TurnOutcome::Cancelled
    } else {
        TurnOutcome::Failed { error: e.to_string() }
    }
}

/// §4.4, steps 1–13.
pub async fn run_turn(
    rt: &RuntimeContext,
    agent_id: &str,
    source: &str,
    body: &str,
    meta: TriggerMeta,
) -> Result<TurnOutcome> {
    // Step 1–2: generation + system prompt reuse.
    let generation = rt.history.current_generation(agent_id)?;
    let system_prompt = match rt.history.system_prompt(agent_id, generation)? {
        Some(entry) => entry.content,
        None => {
            let tool_names: Vec<String> =
                sa_tools::agent_tools::AgentTools::definitions().iter().map(|d| d.name.clone()).collect();
            let prompt = sa_promptbuilder::build_system_prompt(&rt.config.prompt, &tool_names)?;
            rt.history.append(NewHistoryEntry {
                agent_id: agent_id.to_string(),
                generation,
                entry_type: Some(HistoryEntryType::ToolsConfig),
                content: serde_json::to_string(&tool_names).unwrap_or_default(),
                ..Default::default()
            })?;
            rt.history.append(NewHistoryEntry {
                agent_id: agent_id.to_string(),
                generation,
                entry_type: Some(HistoryEntryType::SystemPrompt),
                content: prompt.clone(),
                ..Default::default()
            })?;
            prompt
        }
    };

    // Step 3: reconstruct prior transcript for this generation.
    let transcript = rt.history.reconstruct_transcript(agent_id, generation)?;
    let mut messages: Vec<Message> = vec![Message::system(system_prompt)];
    for (role, text) in &transcript {
        messages.push(if role == "assistant" { Message::assistant(text.clone()) } else { Message::user(text.clone()) });
    }

    // Step 4: ensure root task, spawn child `llm` task.
    rt.tasks.ensure_agent_task(agent_id)?;
    let llm_task = rt.tasks.spawn(NewTask {
        task_type: task_type::LLM.to_string(),
        owner: agent_id.to_string(),
        parent_id: Some(agent_id.to_string()),
        mode: TaskMode::Async,
        metadata: HashMap::from([
            ("input_target".to_string(), serde_json::json!(agent_id)),
            ("notify_target".to_string(), serde_json::json!(source)),
            ("source".to_string(), serde_json::json!(source)),
            ("priority".to_string(), serde_json::json!(meta.priority.as_str())),
            ("request_id".to_string(), serde_json::json!(meta.request_id)),
            ("event_id".to_string(), serde_json::json!(meta.event_id)),
            ("history_generation".to_string(), serde_json::json!(generation)),
        ]),
        ..Default::default()
    })?;
    rt.tasks.mark_running(&llm_task.id)?;
    TraceEvent::TurnStarted {
        agent_id: agent_id.to_string(),
        llm_task_id: llm_task.id.clone(),
        generation,
    }
    .emit();
    rt.tasks.record_update(&llm_task.id, update_kind::INPUT, serde_json::json!({ "body": body }))?;
    rt.history.append(NewHistoryEntry {
        agent_id: agent_id.to_string(),
        generation,
        entry_type: Some(HistoryEntryType::UserMessage),
        content: body.to_string(),
        task_id: Some(llm_task.id.clone()),
        ..Default::default()
    })?;

    // Step 5: turn context.
    let previous_turn_time = rt.previous_turn_time(agent_id);
    let tctx = compute_turn_context(chrono::Utc::now(), previous_turn_time);
    rt.set_previous_turn_time(agent_id, tctx.now);

    // Step 6: collect + project unread context events. The triggering
    // event is excluded here — it's rendered as `<message>` below, so
    // keeping it in `raw`/`items` would render it a second time as a
    // `<context_updates><event>` with the same text (§4.4 step 7: "omitted
    // if already represented as a context message event").
    let window_n = rt.config.runtime.context_window_n;
    let raw: Vec<_> = collect_unread_context_events(rt, agent_id, window_n * 2)?
        .into_iter()
        .filter(|(_, event)| event.id != meta.event_id)
        .collect();
    let scanned = raw.len();
    let from_event_id = raw.iter().map(|(_, e)| e.id.clone()).min();
    let to_event_id = raw.iter().map(|(_, e)| e.id.clone()).max();

    let projection = project_context_events(raw, window_n);
    let superseded = projection.superseded;
    let items = projection.items;
    let consumed: HashSet<(String, String)> =
        items.iter().map(|i| (i.stream.clone(), i.event.id.clone())).collect();

    for item in &items {
        rt.history.append(context_item_history_entry(agent_id, generation, item))?;
    }
    if tctx.time_passed {
        rt.history.append(system_update_entry(agent_id, generation, "time_passed"))?;
    }
    if tctx.date_changed {
        rt.history.append(system_update_entry(agent_id, generation, "date_changed"))?;
    }

    // Step 7: render XML envelope + llm_input history entry. `items` never
    // contains the trigger (filtered above), so `<message>` is always the
    // sole representation of it.
    let envelope = render_envelope(Some(body), source, meta.priority, &items, tctx.time_passed, tctx.date_changed);
    rt.history.append(NewHistoryEntry {
        agent_id: agent_id.to_string(),
        generation,
        entry_type: Some(HistoryEntryType::LlmInput),
        content: envelope.clone(),
        task_id: Some(llm_task.id.clone()),
        data: Some(serde_json::json!({
            "scanned": scanned,
            "emitted": items.len(),
            "superseded": superseded,
            "from_event_id": from_event_id,
            "to_event_id": to_event_id,
        })),
        ..Default::default()
    })?;
    messages.push(Message::user(envelope));

    // Steps 8-10: drive the model, racing the interrupt/command watchers.
    let turn_token = CancellationToken::new();
    let interrupt_handle = tokio::spawn(interrupt_watcher(rt.bus.clone(), agent_id.to_string(), turn_token.child_token()));
    let command_handle = tokio::spawn(command_watcher(rt.bus.clone(), llm_task.id.clone(), turn_token.child_token()));

    let mut ignored_wake_ids: IgnoredWakeIds = HashSet::new();
    ignored_wake_ids.insert(meta.event_id.clone());
    for item in &items {
        ignored_wake_ids.insert(item.event.id.clone());
    }

    let tool_ctx = ToolContext { agent_id: agent_id.to_string() };
    let run_result = run_tool_loop(rt, agent_id, generation, &llm_task.id, &mut messages, &tool_ctx, &ignored_wake_ids, &turn_token).await;

    turn_token.cancel();
    interrupt_handle.abort();
    command_handle.abort();

    // Step 13: ack every collected context event. The triggering event
    // itself is only acked on a non-failed outcome (§8 S7: a failed turn
    // leaves it unread so a future healthy process replays it).
    let mut by_stream: HashMap<String, Vec<String>> = HashMap::new();
    for (stream, id) in consumed {
        by_stream.entry(stream).or_default().push(id);
    }
    for (stream, ids) in by_stream {
        rt.bus.ack(&stream, &ids, agent_id)?;
    }

    // Steps 11-12: finish the `llm` task and notify `source`.
    let turn_failed = run_result.is_err() && !matches!(run_result, Err(ref e) if e.is_cancellation());
    if !turn_failed {
        rt.bus.ack(&meta.stream, &[meta.event_id.clone()], agent_id)?;
    }
    let outcome = match run_result {
        Ok(output) => {
            rt.tasks.complete(&llm_task.id, serde_json::json!({ "output": output }))?;
            TraceEvent::TurnCompleted {
                agent_id: agent_id.to_string(),
                llm_task_id: llm_task.id.clone(),
                output_chars: output.chars().count(),
            }
            .emit();
            rt.history.append(NewHistoryEntry {
                agent_id: agent_id.to_string(),
                generation,
                entry_type: Some(HistoryEntryType::AssistantMessage),
                content: output.clone(),
                task_id: Some(llm_task.id.clone()),
                ..Default::default()
            })?;
            rt.bus.push(NewEvent {
                stream: STREAM_SIGNALS.to_string(),
                scope_type: Some(ScopeType::Agent),
                scope_id: Some(agent_id.to_string()),
                subject: Some("agent_run_complete".to_string()),
                body: format!("turn for {agent_id} completed"),
                source_id: Some(agent_id.to_string()),
                ..Default::default()
            })?;
            if source != agent_id {
                rt.bus.push(NewEvent {
                    stream: sa_domain::model::STREAM_EXTERNAL.to_string(),
                    scope_type: Some(ScopeType::Task),
                    scope_id: Some(source.to_string()),
                    body: output.clone(),
                    source_id: Some(agent_id.to_string()),
                    ..Default::default()
                })?;
            }

            // Compaction: only a healthy turn may bump the generation —
            // a failed turn must keep replaying the generation it failed
            // in so the next attempt sees the same prior messages.
            crate::compact::maybe_compact(&rt.history, agent_id, &rt.config.compaction)?;

            TurnOutcome::Completed { output }
        }
        Err(e) => {
            let outcome = classify_error(&e);
            rt.history.append(NewHistoryEntry {
                agent_id: agent_id.to_string(),
                generation,
                entry_type: Some(HistoryEntryType::Error),
                content: e.to_string(),
                task_id: Some(llm_task.id.clone()),
                ..Default::default()
            })?;
            match &outcome {
                TurnOutcome::Cancelled => {
                    rt.tasks.cancel(&llm_task.id, e.to_string(), agent_id)?;
                    TraceEvent::TurnCancelled {
                        agent_id: agent_id.to_string(),
                        llm_task_id: llm_task.id.clone(),
                        reason: e.to_string(),
                    }
                    .emit();
                }
                _ => {
                    rt.tasks.fail(&llm_task.id, e.to_string())?;
                }
            }
            rt.bus.push(NewEvent {
                stream: STREAM_ERRORS.to_string(),
                scope_type: Some(ScopeType::Agent),
                scope_id: Some(agent_id.to_string()),
                subject: Some("agent_run_error".to_string()),
                body: e.to_string(),
                source_id: Some(agent_id.to_string()),
                ..Default::default()
            })?;
            if source != agent_id {
                rt.bus.push(NewEvent {
                    stream: sa_domain::model::STREAM_EXTERNAL.to_string(),
                    scope_type: Some(ScopeType::Task),
                    scope_id: Some(source.to_string()),
                    body: format!("[error] {e}"),
                    source_id: Some(agent_id.to_string()),
                    ..Default::default()
                })?;
            }
            outcome
        }
    };

    Ok(outcome)
}

/// Steps 8-10: drives the provider stream, buffering tool-call deltas,
/// dispatching finished calls, and looping back with tool results while
/// `finish_reason == "tool_calls"`. Bounded by `config.runtime.max_tool_loops`.
async fn run_tool_loop(
    rt: &RuntimeContext,
    agent_id: &str,
    generation: u64,
    llm_task_id: &str,
    messages: &mut Vec<Message>,
    tool_ctx: &ToolContext,
    ignored_wake_ids: &IgnoredWakeIds,
    turn_token: &CancellationToken,
) -> Result<String> {
    let tool_defs = sa_tools::agent_tools::AgentTools::definitions();
    let mut accumulated = String::new();

    for _ in 0..rt.config.runtime.max_tool_loops {
        let request = ChatRequest { messages: messages.clone(), tools: tool_defs.clone(), ..Default::default() };

        let mut stream = tokio::select! {
            _ = turn_token.cancelled() => return Err(Error::Cancelled("turn interrupted".to_string())),
            result = rt.provider.chat_stream(request) => result?,
        };

        let mut text = String::new();
        let mut tool_calls: Vec<(String, String)> = Vec::new();
        let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
        let mut finish_reason: Option<String> = None;

        loop {
            let next = tokio::select! {
                _ = turn_token.cancelled() => return Err(Error::Cancelled("turn interrupted".to_string())),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            match event? {
                StreamEvent::MessageStart => {}
                StreamEvent::Token { text: chunk } => {
                    text.push_str(&chunk);
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_TEXT, serde_json::json!({ "text": chunk }))?;
                }
                StreamEvent::Thinking { text: chunk } => {
                    rt.history.append(NewHistoryEntry {
                        agent_id: agent_id.to_string(),
                        generation,
                        entry_type: Some(HistoryEntryType::Reasoning),
                        content: chunk,
                        task_id: Some(llm_task_id.to_string()),
                        ..Default::default()
                    })?;
                }
                StreamEvent::ThinkingDone => {}
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    tc_bufs.insert(call_id.clone(), (tool_name.clone(), String::new()));
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_TOOL_START, serde_json::json!({ "call_id": call_id, "tool_name": tool_name }))?;
                    rt.history.append(NewHistoryEntry {
                        agent_id: agent_id.to_string(),
                        generation,
                        entry_type: Some(HistoryEntryType::ToolCall),
                        content: String::new(),
                        task_id: Some(llm_task_id.to_string()),
                        tool_call_id: Some(call_id),
                        tool_name: Some(tool_name),
                        ..Default::default()
                    })?;
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, buf)) = tc_bufs.get_mut(&call_id) {
                        buf.push_str(&delta);
                    }
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_TOOL_DELTA, serde_json::json!({ "call_id": call_id, "delta": delta }))?;
                }
                StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                    tc_bufs.remove(&call_id);
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_TOOL_DONE, serde_json::json!({ "call_id": call_id, "arguments": arguments }))?;
                    tool_calls.push((call_id.clone(), tool_name.clone()));
                    let (output, is_error) = rt.tools.dispatch(tool_ctx, &tool_name, &arguments, ignored_wake_ids).await;
                    let (clipped, _) = crate::context::clip(&output, TOOL_RESULT_CLIP);
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_TOOL_STATUS, serde_json::json!({ "call_id": call_id, "status": if is_error { "error" } else { "ok" } }))?;
                    rt.history.append(NewHistoryEntry {
                        agent_id: agent_id.to_string(),
                        generation,
                        entry_type: Some(HistoryEntryType::ToolResult),
                        content: clipped.clone(),
                        task_id: Some(llm_task_id.to_string()),
                        tool_call_id: Some(call_id.clone()),
                        tool_name: Some(tool_name),
                        tool_status: Some(if is_error { "error".to_string() } else { "ok".to_string() }),
                        ..Default::default()
                    })?;
                    messages.push(Message {
                        role: Role::Tool,
                        content: MessageContent::Parts(vec![ContentPart::ToolResult {
                            tool_use_id: call_id,
                            content: clipped,
                            is_error,
                        }]),
                    });
                }
                StreamEvent::ToolStatus { call_id, status } => {
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_TOOL_STATUS, serde_json::json!({ "call_id": call_id, "status": status }))?;
                }
                StreamEvent::Image { url } => {
                    rt.tasks.record_update(llm_task_id, update_kind::LLM_IMAGE, serde_json::json!({ "url": url }))?;
                }
                StreamEvent::Done { finish_reason: reason, .. } => {
                    finish_reason = reason;
                }
                StreamEvent::Error { message } => return Err(Error::Provider { provider: rt.provider.provider_id().to_string(), message }),
            }
        }

        // Any tool call that started but never finished: best-effort parse.
        for (call_id, (tool_name, raw_args)) in tc_bufs {
            let arguments: serde_json::Value = serde_json::from_str(&raw_args).unwrap_or_else(|_| serde_json::json!({}));
            let (output, is_error) = rt.tools.dispatch(tool_ctx, &tool_name, &arguments, ignored_wake_ids).await;
            let (clipped, _) = crate::context::clip(&output, TOOL_RESULT_CLIP);
            messages.push(Message {
                role: Role::Tool,
                content: MessageContent::Parts(vec![ContentPart::ToolResult { tool_use_id: call_id, content: clipped, is_error }]),
            });
        }

        if !text.is_empty() {
            accumulated.push_str(&text);
            messages.push(Message::assistant(text));
        }

        if finish_reason.as_deref() != Some("tool_calls") || tool_calls.is_empty() {
            return Ok(accumulated);
        }
    }

    Ok(accumulated)
}

//! Turn context, unread-event collection/projection, and the XML input
//! envelope (spec §4.3 step 1, §4.4 steps 5–7, §6.3). Pure functions where
//! possible so the projection/rendering rules are unit-testable without a
//! store or a provider.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sa_domain::error::Result;
use sa_domain::model::{
    Event, Priority, ScopeType, STREAM_ERRORS, STREAM_EXTERNAL, STREAM_SIGNALS,
    STREAM_TASK_INPUT, STREAM_TASK_OUTPUT,
};
use sa_store::EventFilter;

use crate::RuntimeContext;

/// Streams an agent loop subscribes to (§4.3). `task_input` wakes the
/// agent's own loop; the rest carry messages, task progress, and errors.
pub const AGENT_STREAMS: [&str; 5] = [
    STREAM_TASK_OUTPUT,
    STREAM_SIGNALS,
    STREAM_ERRORS,
    STREAM_EXTERNAL,
    STREAM_TASK_INPUT,
];

/// §4.3 priority rule: an unprioritized `message`-kind event is promoted
/// to `wake`; everything else uses its explicit (or default `normal`)
/// priority.
pub fn effective_priority(event: &Event) -> Priority {
    if event.metadata.get("priority").is_none() && event.kind() == Some("message") {
        Priority::Wake
    } else {
        event.priority()
    }
}

/// The wake event chosen by `replay_unread_wake_events`, tagged with the
/// stream it arrived on (needed to `ack` it later).
pub struct TriggerEvent {
    pub event: Event,
    pub stream: String,
}

/// Pulls unread events targeting `agent_id` across all agent streams, up
/// to `limit_per_stream` each. `sa_store`'s reader filter already applies
/// the §4.3 targeting rule (global, or scoped to this exact reader).
pub fn collect_unread_context_events(
    rt: &RuntimeContext,
    agent_id: &str,
    limit_per_stream: usize,
) -> Result<Vec<(String, Event)>> {
    let mut out = Vec::new();
    for stream in AGENT_STREAMS {
        let summaries = rt.bus.list(
            stream,
            &EventFilter {
                reader: Some(agent_id.to_string()),
                limit: limit_per_stream,
                ..Default::default()
            },
        )?;
        let unread_ids: Vec<String> = summaries.into_iter().filter(|s| !s.read).map(|s| s.id).collect();
        if unread_ids.is_empty() {
            continue;
        }
        for event in rt.bus.read(stream, &unread_ids)? {
            out.push((stream.to_string(), event));
        }
    }
    Ok(out)
}

/// §4.3 step 1: the first unread event (by `(priority rank, created_at,
/// id)`) whose effective priority is `wake` or `interrupt`.
pub fn replay_unread_wake_events(
    rt: &RuntimeContext,
    agent_id: &str,
    window_n: usize,
) -> Result<Option<TriggerEvent>> {
    let mut candidates = collect_unread_context_events(rt, agent_id, window_n)?;
    candidates.sort_by(|a, b| {
        effective_priority(&a.1)
            .rank()
            .cmp(&effective_priority(&b.1).rank())
            .then(a.1.created_at.cmp(&b.1.created_at))
            .then(a.1.id.cmp(&b.1.id))
    });
    for (stream, event) in candidates {
        if effective_priority(&event).is_preempting() {
            return Ok(Some(TriggerEvent { event, stream }));
        }
    }
    Ok(None)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn context (§4.4 step 5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const TIME_PASSED_THRESHOLD: Duration = Duration::from_secs(60);

pub struct TurnContext {
    pub now: DateTime<Utc>,
    pub previous_turn_time: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    pub time_passed: bool,
    pub date_changed: bool,
}

pub fn compute_turn_context(now: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> TurnContext {
    let elapsed = previous
        .and_then(|p| now.signed_duration_since(p).to_std().ok())
        .unwrap_or_default();
    let date_changed = previous.map(|p| p.date_naive() != now.date_naive()).unwrap_or(false);
    TurnContext {
        now,
        previous_turn_time: previous,
        elapsed,
        time_passed: previous.is_some() && elapsed >= TIME_PASSED_THRESHOLD,
        date_changed,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Projection (§4.4 step 6)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One surviving context event, still paired with the stream it came
/// from. A run of `task_output` events for the same task has already been
/// folded into a single synthetic event carrying
/// `metadata.kind = "task_update_summary"` (§4.4 step 6).
pub struct ContextItem {
    pub stream: String,
    pub event: Event,
}

/// Result of §4.4 step 6: the surviving context items plus `superseded`
/// — raw events folded into a `task_update_summary` rather than kept as
/// their own item (everything in a group but its `latest` survivor).
/// Used to fill the `llm_input` history entry's counters (§4.4 step 7).
pub struct Projection {
    pub items: Vec<ContextItem>,
    pub superseded: usize,
}

pub fn project_context_events(raw: Vec<(String, Event)>, window_n: usize) -> Projection {
    let kept: Vec<(String, Event)> = raw
        .into_iter()
        .filter(|(stream, e)| e.priority() != Priority::Low || stream == STREAM_TASK_OUTPUT)
        .collect();

    let mut items: Vec<ContextItem> = Vec::new();
    let mut groups: HashMap<String, Vec<Event>> = HashMap::new();
    let mut group_order: Vec<String> = Vec::new();

    for (stream, event) in kept {
        if stream == STREAM_TASK_OUTPUT {
            if let Some(task_id) = event.task_id().map(str::to_string) {
                if !groups.contains_key(&task_id) {
                    group_order.push(task_id.clone());
                }
                groups.entry(task_id).or_default().push(event);
                continue;
            }
        }
        items.push(ContextItem { stream, event });
    }

    let mut superseded = 0usize;
    for task_id in group_order {
        let group = groups.remove(&task_id).unwrap_or_default();
        superseded += group.len().saturating_sub(1);
        let Some(latest) = group.iter().max_by_key(|e| e.created_at).cloned() else {
            continue;
        };
        let kinds: Vec<String> = group.iter().filter_map(|e| e.action().map(str::to_string)).collect();

        let mut summary = latest.clone();
        summary
            .metadata
            .insert("kind".to_string(), serde_json::json!("task_update_summary"));
        summary.payload.insert("count".to_string(), serde_json::json!(group.len()));
        summary.payload.insert("kinds".to_string(), serde_json::json!(kinds));
        summary.payload.insert("latest".to_string(), serde_json::json!(latest.id));
        summary.body = format!("{} updates for task {task_id}", group.len());
        items.push(ContextItem { stream: STREAM_TASK_OUTPUT.to_string(), event: summary });
    }

    // Selection favors higher priority, then newer; then keep at most N.
    items.sort_by(|a, b| {
        a.event
            .priority()
            .rank()
            .cmp(&b.event.priority().rank())
            .then(b.event.created_at.cmp(&a.event.created_at))
    });
    items.truncate(window_n);

    // Output ordering for the prompt is (priority, created_at, id) ascending.
    items.sort_by(|a, b| {
        a.event
            .priority()
            .rank()
            .cmp(&b.event.priority().rank())
            .then(a.event.created_at.cmp(&b.event.created_at))
            .then(a.event.id.cmp(&b.event.id))
    });
    Projection { items, superseded }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// XML envelope (§6.3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Clips `s` to at most `limit` chars, appending a trailing " …" marker
/// when truncated. Returns `(text, truncated)`.
pub fn clip(s: &str, limit: usize) -> (String, bool) {
    if s.chars().count() <= limit {
        return (s.to_string(), false);
    }
    let mut clipped: String = s.chars().take(limit).collect();
    clipped.push_str(" …");
    (clipped, true)
}

pub fn render_envelope(
    message: Option<&str>,
    source: &str,
    priority: Priority,
    items: &[ContextItem],
    time_passed: bool,
    date_changed: bool,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "<system_updates source=\"{}\" priority=\"{}\">\n",
        xml_escape(source),
        priority.as_str()
    ));
    if let Some(message) = message {
        out.push_str(&format!("  <message>{}</message>\n", xml_escape(message)));
    }
    out.push_str("  <context_updates>\n");
    if time_passed {
        out.push_str("    <system_update kind=\"time_passed\" />\n");
    }
    if date_changed {
        out.push_str("    <system_update kind=\"date_changed\" />\n");
    }
    for item in items {
        let event = &item.event;
        let body_limit = if event.priority().is_preempting() { 500 } else { 200 };
        let (body, truncated) = clip(&event.body, body_limit);
        let metadata_json = serde_json::to_string(&event.metadata).unwrap_or_default();
        let (metadata, _) = clip(&metadata_json, 900);
        let task_kind = event
            .metadata
            .get("task_kind")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        out.push_str(&format!(
            "    <event stream=\"{}\" priority=\"{}\" task_id=\"{}\" task_kind=\"{}\" created_at=\"{}\">\n",
            xml_escape(&item.stream),
            event.priority().as_str(),
            xml_escape(event.task_id().unwrap_or("")),
            xml_escape(task_kind),
            event.created_at.to_rfc3339(),
        ));
        if let Some(subject) = &event.subject {
            out.push_str(&format!("      <subject>{}</subject>\n", xml_escape(subject)));
        }
        out.push_str(&format!(
            "      <body truncated=\"{truncated}\">{}</body>\n",
            xml_escape(&body)
        ));
        out.push_str(&format!("      <metadata>{}</metadata>\n", xml_escape(&metadata)));
        out.push_str("    </event>\n");
    }
    out.push_str("  </context_updates>\n");
    out.push_str("</system_updates>");
    out
}

/// §4.4 step 6: record a `context_event` history entry per surviving event.
pub fn context_item_history_entry(
    agent_id: &str,
    generation: u64,
    item: &ContextItem,
) -> sa_domain::model::NewHistoryEntry {
    sa_domain::model::NewHistoryEntry {
        agent_id: agent_id.to_string(),
        generation,
        entry_type: Some(sa_domain::model::HistoryEntryType::ContextEvent),
        content: item.event.body.clone(),
        task_id: item.event.task_id().map(str::to_string),
        data: Some(serde_json::json!({
            "stream": item.stream,
            "event_id": item.event.id,
            "priority": item.event.priority().as_str(),
        })),
        ..Default::default()
    }
}

pub fn system_update_entry(
    agent_id: &str,
    generation: u64,
    kind: &str,
) -> sa_domain::model::NewHistoryEntry {
    sa_domain::model::NewHistoryEntry {
        agent_id: agent_id.to_string(),
        generation,
        entry_type: Some(sa_domain::model::HistoryEntryType::SystemUpdate),
        content: kind.to_string(),
        ..Default::default()
    }
}

/// Whether `scope_type`/`scope_id` combination targets `reader` — used by
/// the health monitor and a couple of tests that build events by hand
/// rather than through the store.
pub fn targets(scope_type: ScopeType, scope_id: &str, reader: &str) -> bool {
    matches!(scope_type, ScopeType::Global) || scope_id == reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::ScopeType;
    use std::collections::{HashMap as Map, HashSet};

    fn event(stream: &str, priority: Option<&str>, kind: Option<&str>, task_id: Option<&str>) -> (String, Event) {
        let mut metadata = Map::new();
        if let Some(p) = priority {
            metadata.insert("priority".to_string(), serde_json::json!(p));
        }
        if let Some(k) = kind {
            metadata.insert("kind".to_string(), serde_json::json!(k));
        }
        if let Some(t) = task_id {
            metadata.insert("task_id".to_string(), serde_json::json!(t));
        }
        (
            stream.to_string(),
            Event {
                id: sa_domain::ids::new_sortable_id(),
                stream: stream.to_string(),
                scope_type: ScopeType::Agent,
                scope_id: "agent-1".to_string(),
                subject: None,
                body: "hi".to_string(),
                metadata,
                payload: Map::new(),
                created_at: Utc::now(),
                read_by: HashSet::new(),
            },
        )
    }

    #[test]
    fn unprioritized_message_is_promoted_to_wake() {
        let (_, e) = event("signals", None, Some("message"), None);
        assert_eq!(effective_priority(&e), Priority::Wake);
    }

    #[test]
    fn explicit_priority_is_not_overridden() {
        let (_, e) = event("signals", Some("low"), Some("message"), None);
        assert_eq!(effective_priority(&e), Priority::Low);
    }

    #[test]
    fn low_priority_non_task_output_events_are_dropped() {
        let raw = vec![event("signals", Some("low"), None, None)];
        assert!(project_context_events(raw, 24).items.is_empty());
    }

    #[test]
    fn low_priority_task_output_is_kept_and_survives_as_a_summary() {
        let raw = vec![event(STREAM_TASK_OUTPUT, Some("low"), None, Some("t1"))];
        let projection = project_context_events(raw, 24);
        assert_eq!(projection.items.len(), 1);
        assert_eq!(projection.items[0].event.kind(), Some("task_update_summary"));
    }

    #[test]
    fn consecutive_task_output_events_for_one_task_fold_into_one_summary() {
        let raw = vec![
            event(STREAM_TASK_OUTPUT, None, None, Some("t1")),
            event(STREAM_TASK_OUTPUT, None, None, Some("t1")),
            event(STREAM_TASK_OUTPUT, None, None, Some("t2")),
        ];
        let projection = project_context_events(raw, 24);
        assert_eq!(projection.items.len(), 2);
        assert_eq!(projection.superseded, 1, "one of the two t1 events was folded into the survivor");
        let t1 = projection.items.iter().find(|i| i.event.task_id() == Some("t1")).unwrap();
        assert_eq!(t1.event.payload.get("count").unwrap(), &serde_json::json!(2));
    }

    #[test]
    fn keeps_at_most_window_n_favoring_higher_priority() {
        let raw = vec![
            event("signals", Some("normal"), Some("x"), None),
            event("signals", Some("wake"), Some("x"), None),
            event("signals", Some("normal"), Some("x"), None),
        ];
        let items = project_context_events(raw, 2).items;
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|i| i.event.priority() == Priority::Wake));
    }

    #[test]
    fn output_order_is_priority_then_created_at_ascending() {
        let raw = vec![
            event("signals", Some("normal"), Some("x"), None),
            event("signals", Some("wake"), Some("x"), None),
        ];
        let items = project_context_events(raw, 24).items;
        assert_eq!(items[0].event.priority(), Priority::Wake);
        assert_eq!(items[1].event.priority(), Priority::Normal);
    }

    #[test]
    fn clip_appends_marker_only_when_truncated() {
        let (short, truncated) = clip("hi", 10);
        assert_eq!(short, "hi");
        assert!(!truncated);
        let (long, truncated) = clip(&"x".repeat(20), 5);
        assert_eq!(long, "xxxxx …");
        assert!(truncated);
    }

    #[test]
    fn envelope_escapes_and_marks_truncated_bodies() {
        let raw = vec![event("signals", Some("wake"), Some("x"), None)];
        let mut items = project_context_events(raw, 24).items;
        items[0].event.body = "<tag> & \"quoted\"".to_string();
        let xml = render_envelope(Some("hello <world>"), "operator", Priority::Wake, &items, false, false);
        assert!(xml.contains("&lt;tag&gt; &amp; &quot;quoted&quot;"));
        assert!(xml.contains("hello &lt;world&gt;"));
    }

    #[test]
    fn turn_context_flags_elapsed_and_date_change() {
        let previous = Utc::now() - chrono::Duration::seconds(120);
        let tctx = compute_turn_context(Utc::now(), Some(previous));
        assert!(tctx.time_passed);
    }

    #[test]
    fn first_turn_has_no_time_passed_flag() {
        let tctx = compute_turn_context(Utc::now(), None);
        assert!(!tctx.time_passed);
    }
}

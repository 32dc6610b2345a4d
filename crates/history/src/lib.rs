//! History Log (spec §4.4 step 1, §9 "prompt cache stability", invariant
//! 6). A generation-partitioned append log over `sa_store::Store`'s
//! `history_entries` table, plus the in-memory generation counter that
//! `CompactAgentContext` bumps. Canonical truth is the store — the
//! counter is rebuilt from `latest_generation` on first touch per agent,
//! so the process may restart at any time (§9 "Global state").

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sa_domain::error::Result;
use sa_domain::model::{HistoryEntry, HistoryEntryType, NewHistoryEntry};
use sa_store::Store;

pub struct HistoryLog {
    store: Arc<Store>,
    generations: Mutex<HashMap<String, u64>>,
}

impl HistoryLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, generations: Mutex::new(HashMap::new()) }
    }

    /// Current generation for `agent_id`, starting at 1 if the agent has
    /// no history yet (§4.4 step 1).
    pub fn current_generation(&self, agent_id: &str) -> Result<u64> {
        if let Some(g) = self.generations.lock().get(agent_id).copied() {
            return Ok(g);
        }
        let g = self.store.latest_generation(agent_id)?.unwrap_or(1);
        self.generations.lock().insert(agent_id.to_string(), g);
        Ok(g)
    }

    /// §9 `CompactAgentContext`: bumps the generation and records the
    /// boundary. Subsequent turns will not replay older generations.
    pub fn compact(&self, agent_id: &str, reason: &str) -> Result<u64> {
        let current = self.current_generation(agent_id)?;
        let next = current + 1;
        self.store.append_history_entry(NewHistoryEntry {
            agent_id: agent_id.to_string(),
            generation: next,
            entry_type: Some(HistoryEntryType::ContextCompaction),
            content: reason.to_string(),
            ..Default::default()
        })?;
        self.generations.lock().insert(agent_id.to_string(), next);
        Ok(next)
    }

    pub fn append(&self, mut entry: NewHistoryEntry) -> Result<HistoryEntry> {
        if entry.generation == 0 {
            entry.generation = self.current_generation(&entry.agent_id)?;
        }
        self.store.append_history_entry(entry)
    }

    pub fn list_for_generation(&self, agent_id: &str, generation: u64) -> Result<Vec<HistoryEntry>> {
        self.store.list_history_for_generation(agent_id, generation)
    }

    /// The generation's stored `system_prompt` entry, if one has already
    /// been recorded — reused byte-for-byte per turn (§4.4 step 2).
    pub fn system_prompt(&self, agent_id: &str, generation: u64) -> Result<Option<HistoryEntry>> {
        self.store.find_history_entry(agent_id, generation, HistoryEntryType::SystemPrompt)
    }

    /// §4.4 step 3: merge consecutive same-role `user_message` /
    /// `assistant_message` entries with `\n\n`, dropping a trailing
    /// `user_message` (it indicates a prior failed turn).
    pub fn reconstruct_transcript(&self, agent_id: &str, generation: u64) -> Result<Vec<(String, String)>> {
        let entries = self.list_for_generation(agent_id, generation)?;
        let mut merged: Vec<(String, String)> = Vec::new();

        for entry in &entries {
            let role = match entry.entry_type {
                HistoryEntryType::UserMessage => "user",
                HistoryEntryType::AssistantMessage => "assistant",
                _ => continue,
            };
            match merged.last_mut() {
                Some((last_role, text)) if last_role == role => {
                    text.push_str("\n\n");
                    text.push_str(&entry.content);
                }
                _ => merged.push((role.to_string(), entry.content.clone())),
            }
        }

        if matches!(merged.last(), Some((role, _)) if role == "user") {
            merged.pop();
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> HistoryLog {
        HistoryLog::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn entry(agent: &str, entry_type: HistoryEntryType, content: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            agent_id: agent.to_string(),
            entry_type: Some(entry_type),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn starts_at_generation_one() {
        let log = log();
        assert_eq!(log.current_generation("a1").unwrap(), 1);
    }

    #[test]
    fn compact_bumps_generation_and_persists() {
        let log = log();
        assert_eq!(log.compact("a1", "context too large").unwrap(), 2);
        assert_eq!(log.current_generation("a1").unwrap(), 2);

        // A fresh HistoryLog over the same store rebuilds the counter.
        let log2 = HistoryLog::new(log.store.clone());
        assert_eq!(log2.current_generation("a1").unwrap(), 2);
    }

    #[test]
    fn only_current_generation_entries_are_reconstructed() {
        let log = log();
        log.append(entry("a1", HistoryEntryType::UserMessage, "hi")).unwrap();
        log.append(entry("a1", HistoryEntryType::AssistantMessage, "hello")).unwrap();
        log.compact("a1", "boundary").unwrap();
        log.append(entry("a1", HistoryEntryType::UserMessage, "after compaction")).unwrap();

        let transcript = log.reconstruct_transcript("a1", 2).unwrap();
        assert_eq!(transcript.len(), 0, "trailing user_message in generation 2 is dropped");
    }

    #[test]
    fn merges_consecutive_same_role_entries() {
        let log = log();
        log.append(entry("a1", HistoryEntryType::UserMessage, "part one")).unwrap();
        log.append(entry("a1", HistoryEntryType::UserMessage, "part two")).unwrap();
        log.append(entry("a1", HistoryEntryType::AssistantMessage, "reply")).unwrap();

        let transcript = log.reconstruct_transcript("a1", 1).unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0], ("user".to_string(), "part one\n\npart two".to_string()));
        assert_eq!(transcript[1].0, "assistant");
    }

    #[test]
    fn drops_trailing_user_message() {
        let log = log();
        log.append(entry("a1", HistoryEntryType::UserMessage, "hi")).unwrap();
        log.append(entry("a1", HistoryEntryType::AssistantMessage, "hello")).unwrap();
        log.append(entry("a1", HistoryEntryType::UserMessage, "unanswered")).unwrap();

        let transcript = log.reconstruct_transcript("a1", 1).unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].0, "assistant");
    }

    #[test]
    fn system_prompt_is_found_once_recorded() {
        let log = log();
        assert!(log.system_prompt("a1", 1).unwrap().is_none());
        log.append(entry("a1", HistoryEntryType::SystemPrompt, "you are an agent")).unwrap();
        let found = log.system_prompt("a1", 1).unwrap().unwrap();
        assert_eq!(found.content, "you are an agent");
    }
}

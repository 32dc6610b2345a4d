//! Compaction trigger (§4.4 "Compaction"). Adapts the teacher's
//! boundary-detection idiom from `crates/gateway/src/runtime/compact.rs`
//! (`compaction_boundary`, `should_compact`) to `sa-history`'s generation
//! counter: there is no transcript vector to trim here, so crossing the
//! turn threshold simply bumps the generation via `HistoryLog::compact`,
//! and older entries stop being replayed on their own (invariant 6).

use sa_domain::config::CompactionConfig;
use sa_domain::error::Result;
use sa_domain::model::HistoryEntryType;
use sa_domain::trace::TraceEvent;
use sa_history::HistoryLog;

/// Active-turn count for `generation`: the `user_message` entries a turn
/// would otherwise replay. Mirrors the teacher's `active_turn_count`.
pub fn turn_count(history: &HistoryLog, agent_id: &str, generation: u64) -> Result<usize> {
    let entries = history.list_for_generation(agent_id, generation)?;
    Ok(entries.iter().filter(|e| e.entry_type == HistoryEntryType::UserMessage).count())
}

/// Mirrors the teacher's `should_compact`.
pub fn should_compact_with_boundary(turns: usize, config: &CompactionConfig) -> bool {
    config.auto && turns > config.max_turns
}

/// Bump the agent's generation if its current one has grown past the
/// configured threshold. Called after a turn completes successfully;
/// returns the new generation if compaction ran.
pub fn maybe_compact(history: &HistoryLog, agent_id: &str, config: &CompactionConfig) -> Result<Option<u64>> {
    let generation = history.current_generation(agent_id)?;
    let turns = turn_count(history, agent_id, generation)?;
    if should_compact_with_boundary(turns, config) {
        let reason = format!("turn count {turns} exceeded max_turns {}", config.max_turns);
        let new_generation = history.compact(agent_id, &reason)?;
        TraceEvent::CompactionRun {
            agent_id: agent_id.to_string(),
            old_generation: generation,
            new_generation,
            reason,
        }
        .emit();
        Ok(Some(new_generation))
    } else {
        Ok(None)
    }
}

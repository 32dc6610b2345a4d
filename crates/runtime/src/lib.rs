//! Agent Runtime (spec §4.3, §4.4, §4.5, §4.6): the per-agent loop, the
//! turn executor, interrupt/command watchers, and context projection.
//! Everything here is assembled by `sa-kernel` around a concrete
//! `LlmProvider` and `sa_store::Store`.

pub mod agent;
pub mod compact;
pub mod context;
pub mod turn;
mod watchers;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sa_domain::config::Config;
use sa_domain::error::Result;
use sa_domain::model::{task_type, TaskStatus};
use sa_eventbus::EventBus;
use sa_history::HistoryLog;
use sa_providers::LlmProvider;
use sa_store::{Store, TaskFilter};
use sa_tasks::TaskManager;
use sa_tools::AgentTools;

pub use agent::{health_monitor, AgentLoop};
pub use turn::{run_turn, TriggerMeta, TurnOutcome};

/// Everything a turn or an agent loop needs. Cheap to clone via `Arc`;
/// one instance is shared across every agent's loop task.
pub struct RuntimeContext {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskManager>,
    pub history: Arc<HistoryLog>,
    pub tools: Arc<AgentTools>,
    pub provider: Arc<dyn LlmProvider>,
    pub config: Config,
    last_turn_time: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RuntimeContext {
    pub fn new(store: Arc<Store>, provider: Arc<dyn LlmProvider>, config: Config) -> Arc<Self> {
        let bus = EventBus::new(store.clone(), config.event_bus.subscriber_buffer);
        let tasks = Arc::new(TaskManager::new(store.clone(), bus.clone()));
        let history = Arc::new(HistoryLog::new(store.clone()));
        let tools = Arc::new(AgentTools::new(tasks.clone(), bus.clone()));
        Arc::new(Self {
            store,
            bus,
            tasks,
            history,
            tools,
            provider,
            config,
            last_turn_time: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn previous_turn_time(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.last_turn_time.lock().get(agent_id).copied()
    }

    pub(crate) fn set_previous_turn_time(&self, agent_id: &str, at: DateTime<Utc>) {
        self.last_turn_time.lock().insert(agent_id.to_string(), at);
    }

    /// §4.3 "Recovery": on start, any `llm`/`exec` task left `running` by a
    /// previous process is failed with a recovery reason — the only path
    /// that reconciles persisted task state with a fresh in-memory runtime.
    pub fn recover_running_tasks(&self) -> Result<usize> {
        let mut recovered = 0;
        for kind in [task_type::LLM, task_type::EXEC] {
            let running = self.tasks.list(&TaskFilter {
                task_type: Some(kind.to_string()),
                status: Some(TaskStatus::Running),
                ..Default::default()
            })?;
            for task in running {
                self.tasks.fail(&task.id, "recovered: process restarted while task was running")?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

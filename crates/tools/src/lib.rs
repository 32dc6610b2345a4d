//! Tool implementations available to the agent runtime.
//!
//! `agent_tools` is the core subset the runtime actually dispatches
//! (`noop`, `send_message`, `send_task`, `await_task`, `cancel`/`kill`,
//! `exec`). The teacher's local process-spawning machinery
//! (`exec`/`manager`/`process`) has no counterpart here — `exec` only
//! spawns a task for the external worker to run (§6.5) — and was dropped
//! in the final trim pass.

pub mod agent_tools;

pub use agent_tools::{AgentTools, IgnoredWakeIds, ToolContext};

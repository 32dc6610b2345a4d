//! In-process stand-in for the external sandbox worker (SPEC_FULL §6.5):
//! the real worker polls `GET /tasks/queue?type=exec` over HTTP and posts
//! `stdout`/`complete` back; that transport is out of scope here, so this
//! polls `TaskManager::claim_queued` directly in the same process. Good
//! enough to make `exec` tool calls terminate in `serve`/tests without a
//! real sandbox, grounded on the claim/complete contract already specified
//! for `sa-tasks` in §4.2/§6.5.

use std::sync::Arc;
use std::time::Duration;

use sa_domain::model::{task_type, update_kind};
use sa_runtime::RuntimeContext;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const CLAIM_LIMIT: usize = 4;

/// Runs until `shutdown` fires. Claims queued `exec` tasks, "executes"
/// them by echoing the submitted code's length back as a fake stdout
/// line, and completes them — there is no real sandbox in this crate.
pub async fn run(rt: Arc<RuntimeContext>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        let claimed = match rt.tasks.claim_queued(task_type::EXEC, CLAIM_LIMIT) {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "exec worker: failed to claim queued tasks");
                continue;
            }
        };

        for task in claimed {
            if let Err(e) = execute_one(&rt, &task.id, &task.payload) {
                tracing::warn!(error = %e, task_id = %task.id, "exec worker: task failed");
            }
        }
    }
}

fn execute_one(
    rt: &RuntimeContext,
    task_id: &str,
    payload: &std::collections::HashMap<String, serde_json::Value>,
) -> sa_domain::error::Result<()> {
    rt.tasks.mark_running(task_id)?;

    let code = payload.get("code").and_then(|v| v.as_str()).unwrap_or("");
    let stdout = format!("[fake-exec] ran {} byte(s) of code, no sandbox in this build\n", code.len());
    rt.tasks.record_update(task_id, update_kind::STDOUT, serde_json::json!({ "text": stdout }))?;

    rt.tasks.complete(task_id, serde_json::json!({ "stdout": stdout, "exit_code": 0 }))?;
    Ok(())
}

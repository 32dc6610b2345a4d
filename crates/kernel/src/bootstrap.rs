//! Process wiring (SPEC_FULL §0): assembles a [`sa_runtime::RuntimeContext`]
//! from config, grounded on `crates/gateway/src/main.rs::run_server`'s
//! component-by-component construction sequence. Trimmed of everything the
//! HTTP surface needed (CORS, rate limiting, session store, dashboard) —
//! what remains is the four core subsystems plus the in-process harness
//! that stands in for the external provider adapters and sandbox worker
//! (SPEC_FULL §0's "minimal in-process harness").

use std::sync::Arc;

use anyhow::Context;
use sa_domain::config::Config;
use sa_providers::StubProvider;
use sa_runtime::RuntimeContext;
use sa_store::Store;

/// Build the full runtime component graph and recover any task left
/// `running` by a previous process (§4.3 "Recovery").
pub fn build_runtime(config: Config) -> anyhow::Result<Arc<RuntimeContext>> {
    let store = Arc::new(
        Store::open(
            &config.store.db_path,
            config.store.busy_timeout_ms,
            config.store.busy_retries,
            config.store.busy_backoff_ms,
        )
        .with_context(|| format!("opening store at {}", config.store.db_path.display()))?,
    );
    tracing::info!(path = %config.store.db_path.display(), "store ready");
    build_runtime_with_store(store, config)
}

/// Same wiring as [`build_runtime`] but takes an already-open store — used
/// by `serve`/`doctor` in production and directly by integration tests
/// with `Store::open_in_memory()`.
pub fn build_runtime_with_store(store: Arc<Store>, config: Config) -> anyhow::Result<Arc<RuntimeContext>> {
    // No provider adapters are in scope (SPEC_FULL §0): the stub provider
    // always answers "ok" unless a test has scripted it, which is enough
    // to keep `serve`/`doctor` runnable without a real LLM backend.
    let provider = Arc::new(StubProvider::new("stub"));

    let rt = RuntimeContext::new(store, provider, config);

    let recovered = rt
        .recover_running_tasks()
        .context("recovering tasks left running by a previous process")?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "recovered tasks left running by a previous process");
    }

    Ok(rt)
}

use clap::Parser;
use sa_domain::config::{Config, ConfigSeverity};
use sa_kernel::cli::{self, Cli, Command, ConfigCommand};
use sa_kernel::{bootstrap, exec_worker};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config()?;
            serve(config).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            let passed = cli::doctor::run(&config, &config_path)?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("sa-kernel {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing, matching the teacher's `init_tracing` (only
/// used by `serve`; other subcommands print plain text to stdout).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sa_kernel=debug")),
        )
        .json()
        .init();
}

/// Start every configured agent's loop, the health monitor, and the
/// in-process exec-worker harness; run until `ctrl_c`.
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("sa-kernel starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => {
                tracing::warn!(field = %issue.field, message = %issue.message, "config issue")
            }
            ConfigSeverity::Error => {
                tracing::error!(field = %issue.field, message = %issue.message, "config issue")
            }
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let agent_ids = config.agents.ids.clone();
    let rt = bootstrap::build_runtime(config)?;
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    for agent_id in agent_ids {
        let loop_rt = rt.clone();
        let loop_shutdown = shutdown.clone();
        let label = agent_id.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = sa_runtime::AgentLoop::new(loop_rt, agent_id).run(loop_shutdown).await {
                tracing::error!(agent_id = %label, error = %e, "agent loop exited with error");
            }
        }));
        tracing::info!(agent_id = %label, "agent loop started");
    }

    handles.push(tokio::spawn(sa_runtime::health_monitor(rt.clone(), shutdown.clone())));
    tracing::info!("health monitor started");

    handles.push(tokio::spawn(exec_worker::run(rt.clone(), shutdown.clone())));
    tracing::info!("exec worker started (in-process harness, no external sandbox)");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

use sa_domain::config::{Config, ConfigSeverity};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes.
pub fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("sa-kernel doctor");
    println!("================\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_store_openable(config, &mut all_passed);
    check_agents_configured(config, &mut all_passed);
    check_workspace(config, &mut all_passed);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        true,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    let _ = all_passed;
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!("      [{}] {}: {}", issue.severity, issue.field, issue.message);
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

fn check_store_openable(config: &Config, all_passed: &mut bool) {
    let result = sa_store::Store::open(
        &config.store.db_path,
        config.store.busy_timeout_ms,
        config.store.busy_retries,
        config.store.busy_backoff_ms,
    );
    let ok = result.is_ok();
    print_check(
        "Store opens and initializes schema",
        ok,
        match result {
            Ok(_) => config.store.db_path.display().to_string(),
            Err(e) => format!("{}: {e}", config.store.db_path.display()),
        },
    );
    if !ok {
        *all_passed = false;
    }
}

fn check_agents_configured(config: &Config, all_passed: &mut bool) {
    let ok = !config.agents.ids.is_empty();
    print_check(
        "Agents configured",
        ok,
        if ok {
            config.agents.ids.join(", ")
        } else {
            "none configured — serve will start no agent loops".to_string()
        },
    );
    if !ok {
        *all_passed = false;
    }
}

fn check_workspace(config: &Config, all_passed: &mut bool) {
    let path = &config.prompt.workspace_path;
    let exists = path.exists();
    print_check(
        "Prompt workspace directory",
        exists,
        if exists {
            path.display().to_string()
        } else {
            format!("{} (does not exist; prompt builder will use an empty workspace section)", path.display())
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}

use sa_domain::config::{Config, ConfigSeverity};

/// Parse and validate the config, printing any issues.
///
/// Returns `true` when no `Error`-severity issue was found.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{}: {}", issue.field, issue.message);
    }

    println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");

    error_count == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("failed to serialize config: {e}");
            std::process::exit(1);
        }
    }
}

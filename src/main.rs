mod detail;
mod fetcher;
mod listing;
mod models;
mod orchestrator;
mod report;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use models::{Config, KNOWN_DEPARTMENTS};
use orchestrator::{QueryRequest, QueryRunner, QueryState};
use report::{format_period, render_summary, summarize, write_reports};
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "vagas_scraper=info";

/// Uses the given `RUST_LOG` directives when present and valid, otherwise the crate default.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn cli() -> Command {
    Command::new("vagas-scraper")
        .version("0.1")
        .about("Queries the UFF class schedule board for seat availability per program")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("period")
                .short('p')
                .long("period")
                .value_name("YYYYS")
                .help("Academic period, e.g. 20252 or 2025.2 (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("program")
                .long("program")
                .value_name("NAME")
                .help("Program to search as, e.g. \"Química\" (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("department")
                .short('d')
                .long("department")
                .value_name("DEPT")
                .help("3-letter department code or ALL (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("discipline")
                .long("discipline")
                .value_name("CODE")
                .help("Single discipline code; replaces the department filter"),
        )
        .arg(
            Arg::new("show-all-programs")
                .long("show-all-programs")
                .help("Keep seat rows of every program")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("restrict-programs")
                .long("restrict-programs")
                .help("Keep only seat rows of the selected programs")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Output directory for reports"),
        )
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) {
    let values = |name: &str| -> Option<Vec<String>> {
        matches
            .get_many::<String>(name)
            .map(|values| values.cloned().collect())
    };

    if let Some(periods) = values("period") {
        config.periods = periods;
    }
    if let Some(programs) = values("program") {
        config.programs = programs;
    }
    if let Some(departments) = values("department") {
        config.departments = departments;
    }
    if let Some(code) = matches.get_one::<String>("discipline") {
        config.discipline_code = Some(code.clone());
    }
    if matches.get_flag("show-all-programs") {
        config.show_all_programs = true;
    }
    if matches.get_flag("restrict-programs") {
        config.restrict_to_selected_programs = true;
    }
    if let Some(output) = matches.get_one::<String>("output") {
        config.output_directory = Some(output.clone());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(false)
        .init();

    let matches = cli().get_matches();
    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");

    // Load or create configuration
    let mut config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        Config::default().save_to_file(config_file)?;
        println!("⚠️  Please review {} and run the program again.", config_file);
        return Ok(());
    };

    apply_overrides(&mut config, &matches);
    config.validate()?;

    for department in &config.departments {
        if !models::is_all_departments(department) && !KNOWN_DEPARTMENTS.contains(&department.as_str()) {
            warn!(department = %department, "department not in the known list, querying anyway");
        }
    }

    let output_dir = config.output_directory.as_deref().unwrap_or("output").to_string();
    let periods: Vec<String> = config.periods.iter().map(|p| format_period(p)).collect();

    println!("🔍 Querying seat availability at: {}", config.base_url());
    println!("📅 Periods: {}", periods.join(", "));
    println!("🎓 Programs: {}", config.programs.join(", "));
    match &config.discipline_code {
        Some(code) => println!("📚 Discipline: {}", code),
        None => println!("🏫 Departments: {}", config.departments.join(", ")),
    }
    println!("📄 Output directory: {}", output_dir);

    let mut runner = QueryRunner::new(config.base_url())?;
    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n⏹️  Cancel requested, finishing the current page...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let request = QueryRequest::from_config(&config);
    let outcome = match runner.run_query(&request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("❌ Query failed: {:#}", e);
            runner.reset();
            return Err(e);
        }
    };

    if outcome.records.is_empty() {
        println!("❌ No sections found with the selected filters.");
        return Ok(());
    }

    let (csv_path, summary_path) = write_reports(&outcome.records, &output_dir)?;

    println!("\n{}", render_summary(&summarize(&outcome.records)));
    if outcome.status == QueryState::Cancelled {
        println!("⚠️  Query was cancelled; reports contain partial results.");
    }
    println!("✅ {} section rows collected.", outcome.records.len());
    println!("📂 CSV: {}", csv_path.display());
    println!("📂 Summary: {}", summary_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_defaults_to_crate_info() {
        assert_eq!(log_filter(None).to_string(), DEFAULT_LOG_FILTER);
        assert_eq!(log_filter(Some("  ")).to_string(), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn log_filter_keeps_user_directives() {
        let filter = log_filter(Some("vagas_scraper=debug")).to_string();
        assert!(filter.contains("vagas_scraper=debug"));
        assert!(!filter.contains("vagas_scraper=info"));
    }

    #[test]
    fn overrides_replace_config_lists() {
        let matches = cli().get_matches_from([
            "vagas-scraper",
            "--period",
            "2025.1",
            "--period",
            "20252",
            "--restrict-programs",
            "-d",
            "gqi",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &matches);
        assert_eq!(config.periods, vec!["2025.1", "20252"]);
        assert_eq!(config.departments, vec!["gqi"]);
        assert!(config.restrict_to_selected_programs);
    }
}

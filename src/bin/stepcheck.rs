//! stepcheck CLI - runs JSON/YAML test cases against HTTP services and databases.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use stepcheck::{
    run_all, CaseDefinition, CaseLoader, CaseResult, DefaultCaseRunner, PgRelationalClient,
    RunnerConfig, SqlTestDataStore, SqlVariableCatalog, StepStatus,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Connection holding the case audit and variable tables.
const AUDIT_CONNECTION: &str = "audit";

/// stepcheck - declarative test-step runner.
#[derive(Parser, Debug)]
#[command(name = "stepcheck", version, about)]
struct Cli {
    /// Case file or directory path.
    #[arg(short = 'p', long = "path")]
    case_path: Option<String>,

    /// Runner config file (YAML or JSON).
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Filter cases by id or name (partial match).
    #[arg(short = 'f', long = "filter")]
    case_filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Timeout in seconds per HTTP action.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Number of cases run concurrently.
    #[arg(long = "parallelism")]
    parallelism: Option<usize>,

    /// Directory to save case report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Keep test data in memory for this run only.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Postgres URL of the audit database. Also used for any
    /// connection not listed in the config.
    #[arg(long = "database-url", env = "STEPCHECK_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn status_mark(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Passed => "\x1b[32m✓\x1b[0m",
        StepStatus::Skipped => "\x1b[33m-\x1b[0m",
        StepStatus::Continue => "\x1b[34m>\x1b[0m",
        StepStatus::Failed | StepStatus::TimeOut => "\x1b[31m✗\x1b[0m",
    }
}

fn print_case_result(result: &CaseResult, verbose: bool) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} case: {} ({} ms)", status, result.name, result.duration_ms);

    for step in &result.steps {
        info!("  {}. {} {}", step.step_id, status_mark(step.status), step.name);
        for instance in &step.instances {
            if step.instances.len() > 1 {
                info!(
                    "     {} {} ({} ms)",
                    status_mark(instance.status),
                    instance.name,
                    instance.duration_ms
                );
            }
            if !instance.error_message.is_empty() {
                error!("\x1b[31m{}\x1b[0m", instance.error_message.trim());
            }
            if verbose {
                for line in &instance.output {
                    debug!("     {}", line);
                }
            }
        }
    }
}

fn save_case_report(result: &CaseResult, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.case_id.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(result)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(result)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Case: {} ({})\n", result.name, result.case_id));
            content.push_str(&format!("Run: {}\n", result.run_id));
            content.push_str(&format!(
                "Status: {}\n",
                if result.success { "PASS" } else { "FAIL" }
            ));
            content.push_str(&format!("Started: {}\n", result.started_at.to_rfc3339()));
            content.push_str(&format!("Duration: {} ms\n\n", result.duration_ms));
            content.push_str("Steps:\n");
            for step in &result.steps {
                content.push_str(&format!(
                    "  {}. {} ({})\n",
                    step.step_id,
                    step.name,
                    step.status.report_label()
                ));
                for instance in &step.instances {
                    for line in &instance.output {
                        content.push_str(&format!("     {line}\n"));
                    }
                    content.push_str(&format!("     Duration: {} ms\n", instance.duration_ms));
                }
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn prepare_cases(case_path: Option<String>, filter: Option<&str>) -> Result<Vec<CaseDefinition>> {
    let mut loader = CaseLoader::new();
    for path in ["testcase/cases", "test/cases"] {
        if Path::new(path).exists() {
            loader.add_path(path);
        }
    }

    let cases = match case_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
            loader
                .load_path(&path)
                .context(format!("Failed to load cases from {}", path.display()))?
        }
        None => loader.load_all_cases()?,
    };

    let cases: Vec<CaseDefinition> = match filter {
        Some(filter) => {
            let filter = filter.to_lowercase();
            cases
                .into_iter()
                .filter(|c| {
                    c.case_id.to_lowercase().contains(&filter)
                        || c.display_name().to_lowercase().contains(&filter)
                })
                .collect()
        }
        None => cases,
    };

    if cases.is_empty() {
        return Err(anyhow!("No test cases found"));
    }
    Ok(cases)
}

fn build_runner(args: &Cli, config: RunnerConfig, cancel: CancellationToken) -> DefaultCaseRunner {
    let mut database = PgRelationalClient::new(config.databases.clone());
    if let Some(url) = &args.database_url {
        database = database.with_fallback_url(url.clone());
    }
    let database = Arc::new(database);
    let globals = config.globals.clone();

    let mut runner = DefaultCaseRunner::new(config)
        .with_database(database.clone())
        .with_debug(args.debug)
        .with_cancel(cancel);

    if args.database_url.is_some() {
        runner = runner.with_catalog(Arc::new(
            SqlVariableCatalog::new(database.clone(), AUDIT_CONNECTION).with_config(globals),
        ));
        if !args.debug {
            runner = runner.with_store(Arc::new(SqlTestDataStore::new(database, AUDIT_CONNECTION)));
        }
    } else if !args.debug {
        warn!("No database URL given, test data is kept in memory");
    }
    runner
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };
    if let Some(timeout) = args.timeout {
        config.request_timeout = timeout;
    }
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism;
    }
    let parallelism = config.parallelism;

    let cases = prepare_cases(args.case_path.clone(), args.case_filter.as_deref())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining steps");
            on_interrupt.cancel();
        }
    });

    let runner = build_runner(&args, config, cancel);
    let report_dir = args.report_dir.as_ref().map(PathBuf::from);

    info!("Running {} case(s) as run {}...", cases.len(), runner.run_id());
    let total_start = Instant::now();
    let results = run_all(&runner, &cases, parallelism).await;

    let mut passed = 0;
    let mut failed = 0;
    for (case, result) in cases.iter().zip(results) {
        match result {
            Ok(result) => {
                print_case_result(&result, args.verbose);
                if let Some(dir) = &report_dir {
                    match save_case_report(&result, dir, args.report_format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {}", e),
                    }
                }
                if result.success {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                error!("\x1b[31mCase execution error: {} - {:#}\x1b[0m", case.case_id, e);
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if failed > 0 {
        exit(1);
    }

    Ok(())
}

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use datajet::dependencies::ComponentDependencies;
use datajet::lockfile::generate_lock;
use datajet::observability::{MetricsCollector, log_snapshot};
use datajet::registry::{PluginKind, PluginRegistry};
use datajet::validation::{ValidationReport, validate_schema};
use datajet::{PipelineConfig, PipelineContext, Schema, build_pipeline};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            schema,
            data_root,
            workspace_root,
            stage_timeout_ms,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            result_json,
        } => run_schema(RunOptions {
            schema,
            data_root,
            workspace_root,
            stage_timeout_ms,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            result_json,
        }),
        Commands::Validate { schema } => validate_schema_cmd(schema),
        Commands::Lint { patterns } => lint_schemas(&patterns),
        Commands::Lock { schema, output } => lock_schema(schema, output),
        Commands::ListPlugins => list_plugins(),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct RunOptions {
    schema: PathBuf,
    data_root: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
    stage_timeout_ms: Option<u64>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    result_json: Option<PathBuf>,
}

fn run_schema(options: RunOptions) -> Result<()> {
    let schema = Schema::load(&options.schema)?;
    let registry = PluginRegistry::with_defaults()?;

    let defaults = ComponentDependencies::from_env();
    let data_root = match options.data_root {
        Some(path) => absolute(&path)?,
        None => defaults.data_root().to_path_buf(),
    };
    let workspace_root = match options.workspace_root {
        Some(path) => absolute(&path)?,
        None => defaults.workspace_root().to_path_buf(),
    };
    info!(
        schema = %options.schema.display(),
        data_root = %data_root.display(),
        workspace_root = %workspace_root.display(),
        "Building pipeline"
    );
    let dependencies = ComponentDependencies::new(data_root, workspace_root);
    let pipeline = build_pipeline(&registry, schema, Some(dependencies))
        .with_context(|| format!("Failed to build pipeline: {}", options.schema.display()))?;

    let mut config = PipelineConfig::default();
    if let Some(ms) = options.stage_timeout_ms {
        config = config.with_stage_timeout(Duration::from_millis(ms));
    }
    let metrics = MetricsCollector::new();
    let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let ctx = PipelineContext::new(run_id.clone()).with_metrics(metrics.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let started = Instant::now();
    let result = runtime.block_on(pipeline.execute_stage(&config, &ctx));
    metrics.record_total_duration(started.elapsed());

    if let Some(path) = &options.result_json {
        ensure_parent_dir(path, "result")?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create result file: {}", path.display()))?;
        to_writer_pretty(file, &result)
            .with_context(|| format!("Failed to write result JSON: {}", path.display()))?;
        info!(result = %path.display(), "Execution result written");
    }

    if options.print_metrics || options.metrics_json.is_some() || options.metrics_prometheus.is_some()
    {
        let snapshot = metrics.snapshot();
        if options.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &options.metrics_json {
            ensure_parent_dir(path, "metrics")?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = &options.metrics_prometheus {
            ensure_parent_dir(path, "metrics")?;
            std::fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    for pending in &result.pending_validators {
        warn!(run_id = run_id.as_str(), "Pending validator: {pending}");
    }
    if !result.is_success() {
        for error_msg in &result.errors {
            error!(run_id = run_id.as_str(), "{error_msg}");
        }
        bail!(
            "Pipeline run {run_id} failed (validation: {}, execution: {})",
            result.is_validation_success,
            result.is_execution_success
        );
    }

    info!(run_id = run_id.as_str(), "Pipeline completed");
    Ok(())
}

fn list_plugins() -> Result<()> {
    let registry = PluginRegistry::with_defaults()?;
    for kind in [PluginKind::Generator, PluginKind::Wrapper, PluginKind::Datajet] {
        println!("Available {kind}s:");
        for name in registry.known(kind) {
            println!("- {name}");
        }
    }
    Ok(())
}

fn report_findings(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
}

fn validate_schema_cmd(schema_path: PathBuf) -> Result<()> {
    let schema = Schema::load(&schema_path)?;
    let registry = PluginRegistry::with_defaults()?;
    let report = validate_schema(&schema, &registry);
    report_findings(&schema_path, &report);

    if report.is_ok() {
        info!(file = %schema_path.display(), "Schema validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Schema validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lint_schemas(patterns: &[String]) -> Result<()> {
    let mut schemas = Vec::new();
    for pattern in patterns {
        let matches =
            glob::glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        let before = schemas.len();
        for entry in matches {
            schemas.push(entry.with_context(|| format!("Failed to read match for {pattern}"))?);
        }
        if schemas.len() == before {
            warn!(pattern = pattern.as_str(), "Pattern matched no files");
        }
    }
    if schemas.is_empty() {
        bail!("No schema files matched the supplied patterns");
    }

    let registry = PluginRegistry::with_defaults()?;
    let mut failures = 0usize;
    for schema_path in &schemas {
        match Schema::load(schema_path) {
            Ok(schema) => {
                let report = validate_schema(&schema, &registry);
                report_findings(schema_path, &report);
                if report.is_ok() {
                    info!(file = %schema_path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %schema_path.display(), "Failed to load schema: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} of {} schema(s)", schemas.len());
    }

    info!(count = schemas.len(), "All schema lint checks passed");
    Ok(())
}

fn lock_schema(schema_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let schema = Schema::load(&schema_path)?;
    let registry = PluginRegistry::with_defaults()?;
    let report = validate_schema(&schema, &registry);
    report_findings(&schema_path, &report);

    if !report.is_ok() {
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    ensure_parent_dir(&output_path, "lockfile")?;
    generate_lock(&schema, &registry, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn ensure_parent_dir(path: &Path, what: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {what} directory: {}", parent.display()))?;
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path: {}", path.display()))
}

#[derive(Parser)]
#[command(
    name = "datajet",
    version,
    about = "Declarative data pipeline assembler"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and execute a pipeline schema.
    Run {
        schema: PathBuf,
        #[arg(long = "data-root")]
        data_root: Option<PathBuf>,
        #[arg(long = "workspace-root")]
        workspace_root: Option<PathBuf>,
        #[arg(long = "stage-timeout-ms")]
        stage_timeout_ms: Option<u64>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "result-json")]
        result_json: Option<PathBuf>,
    },
    /// Check a schema without building it.
    Validate { schema: PathBuf },
    /// Validate every schema matching the given glob patterns.
    Lint {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Write a lockfile pinning plugin configuration digests.
    Lock { schema: PathBuf, output: PathBuf },
    ListPlugins,
}

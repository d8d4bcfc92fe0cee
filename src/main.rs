//! FlowPilot CLI Entry Point
//!
//! Runs workflow files with the built-in node types against a detached
//! session.
//!
//! # Usage
//!
//! ```bash
//! # Run a single workflow
//! flowpilot login.json
//!
//! # Run every workflow in a folder as one batch
//! flowpilot ./workflows --workers 4
//!
//! # Run a list of files as a high-priority batch
//! flowpilot a.json b.yaml --priority 10
//!
//! # Show batch history
//! flowpilot --history
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use log::{info, warn};

use flowpilot::automation::{DetachedSessionFactory, HandlerRegistry};
use flowpilot::batch::{
    Batch, BatchFilter, BatchOptions, BatchStatus, BatchStore, ExecutionManager, FileBatchStore, Page,
};
use flowpilot::config::EngineConfig;
use flowpilot::execution::{ExecutionSnapshot, ExecutionStatus};
use flowpilot::monitoring::{EventSink, FanoutSink, LogSink, TimelineSink};
use flowpilot::workflow::{load_workflow, WorkflowSource};
use flowpilot::{APP_NAME, VERSION};

/// Batches shown by `--history`.
const HISTORY_PAGE_SIZE: usize = 20;

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Cli {
    inputs: Vec<PathBuf>,
    config_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    workers: Option<usize>,
    priority: i32,
    trace: bool,
    verbose: bool,
    history: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Browser Automation Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowpilot [OPTIONS] <WORKFLOW_FILE|FOLDER>...");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE|FOLDER>  One file runs alone; a folder or several files run as a batch");
    println!();
    println!("Options:");
    println!("  --workers N         Concurrent members of the batch (default from config)");
    println!("  --priority N        Batch priority, higher runs first (default: 0)");
    println!("  --config PATH       Engine configuration file (YAML or JSON)");
    println!("  --data-dir PATH     Directory of the batch history store");
    println!("  --trace             Enable per-node trace logging");
    println!("  --history           List recent batches and exit");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Environment:");
    println!("  FLOWPILOT_MAX_CONCURRENT, FLOWPILOT_DATA_DIR, FLOWPILOT_TRACE");
}

fn option_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String, String> {
    args.get(i)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Parses command-line arguments into a Cli struct.
fn parse_arguments(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => cli.verbose = true,
            "--trace" => cli.trace = true,
            "--history" => cli.history = true,
            "--workers" => {
                i += 1;
                let value = option_value(args, i, "--workers")?;
                let workers: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid workers value: {}", value))?;
                if workers == 0 {
                    return Err("--workers must be at least 1".to_string());
                }
                cli.workers = Some(workers);
            }
            "--priority" => {
                i += 1;
                let value = option_value(args, i, "--priority")?;
                cli.priority = value
                    .parse()
                    .map_err(|_| format!("Invalid priority value: {}", value))?;
            }
            "--config" => {
                i += 1;
                cli.config_path = Some(PathBuf::from(option_value(args, i, "--config")?));
            }
            "--data-dir" => {
                i += 1;
                cli.data_dir = Some(PathBuf::from(option_value(args, i, "--data-dir")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => cli.inputs.push(PathBuf::from(arg)),
        }
        i += 1;
    }

    if cli.inputs.is_empty() && !cli.history {
        return Err("No workflow file or folder given".to_string());
    }
    Ok(cli)
}

fn paint_execution(status: ExecutionStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed => text.green(),
        ExecutionStatus::Error => text.red(),
        ExecutionStatus::Stopped => text.yellow(),
        _ => text.normal(),
    }
}

fn paint_batch(status: BatchStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        BatchStatus::Completed => text.green(),
        BatchStatus::Stopped => text.yellow(),
        _ => text.normal(),
    }
}

fn print_execution(snapshot: &ExecutionSnapshot) {
    print!(
        "  {:<24} {:<10} {} nodes",
        snapshot.workflow_name,
        paint_execution(snapshot.status),
        snapshot.executed_node_ids.len()
    );
    match &snapshot.last_error {
        Some(error) => println!("  {}", error.red()),
        None => println!(),
    }
}

fn print_batch(batch: &Batch) {
    let counts = &batch.counts;
    println!(
        "{} {} [{}] {}/{} completed, {} failed ({} invalid), workers={}, priority={}",
        batch.start_time.format("%Y-%m-%d %H:%M:%S"),
        batch.id.dimmed(),
        paint_batch(batch.status),
        counts.completed,
        counts.total_workflows,
        counts.failed,
        counts.invalid_workflows,
        batch.workers,
        batch.priority
    );
}

async fn print_history(manager: &ExecutionManager) -> Result<(), Box<dyn std::error::Error>> {
    let page = manager
        .get_batch_history(&BatchFilter::default(), Page::new(0, HISTORY_PAGE_SIZE))
        .await?;

    if page.batches.is_empty() {
        println!("No batches recorded");
        return Ok(());
    }
    println!("Showing {} of {} batches:", page.batches.len(), page.total);
    for batch in &page.batches {
        print_batch(batch);
    }
    Ok(())
}

async fn run_single(
    manager: &ExecutionManager,
    timeline: &TimelineSink,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = load_workflow(path)
        .map_err(|e| format!("Could not load workflow from '{}': {}", path.display(), e))?;
    info!(
        "Workflow loaded: {} nodes, {} edges",
        workflow.nodes.len(),
        workflow.edges.len()
    );

    let id = manager.start_single_execution(workflow, None)?;
    let report = tokio::select! {
        report = manager.wait_for_execution(&id) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping execution");
            manager.stop_execution(&id).await?;
            manager.wait_for_execution(&id).await?
        }
    };

    if let Some(chart) = timeline.gantt_chart(&id) {
        println!("{}", chart);
    }
    print_execution(&report);

    match report.status {
        ExecutionStatus::Completed => Ok(()),
        status => Err(format!("Execution finished with status {}", status).into()),
    }
}

async fn run_batch(manager: &ExecutionManager, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let source = match cli.inputs.as_slice() {
        [folder] if folder.is_dir() => WorkflowSource::Folder(folder.clone()),
        files => WorkflowSource::Files(files.to_vec()),
    };

    let mut options = BatchOptions::new().priority(cli.priority);
    if let Some(workers) = cli.workers {
        options = options.workers(workers);
    }

    let batch_id = manager.start_batch_execution(source, options).await?;
    let batch = tokio::select! {
        batch = manager.wait_for_batch(&batch_id) => batch?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping batch");
            manager.stop_batch(&batch_id).await?;
            manager.wait_for_batch(&batch_id).await?
        }
    };

    println!();
    print_batch(&batch);
    for member in manager.get_batch_executions(&batch_id).await? {
        print_execution(&member);
    }
    for rejected in &batch.rejected {
        println!("  {:<24} {}  {}", rejected.source, "invalid".red(), rejected.errors.join("; "));
    }

    if batch.counts.failed > 0 {
        return Err(format!("{} of {} workflows failed", batch.counts.failed, batch.counts.total_workflows).into());
    }
    Ok(())
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let mut config = EngineConfig::resolve(cli.config_path.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.trace_logging |= cli.trace;
    info!(
        "Pool size: {}, data directory: {}",
        config.max_concurrent,
        config.data_dir.display()
    );

    let store: Option<Arc<dyn BatchStore>> = match FileBatchStore::open(&config.data_dir).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Batch history disabled: {}", e);
            None
        }
    };

    let timeline = Arc::new(TimelineSink::new());
    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(LogSink))
            .with(timeline.clone()),
    );

    let manager = ExecutionManager::new(
        config,
        Arc::new(HandlerRegistry::with_builtins()),
        Arc::new(DetachedSessionFactory),
        sink,
        store,
    );

    let recovered = manager.initialize().await;
    if recovered > 0 {
        warn!("Marked {} interrupted batches as stopped", recovered);
    }

    if cli.history {
        return print_history(&manager).await;
    }

    match cli.inputs.as_slice() {
        [path] if path.is_file() => run_single(&manager, &timeline, path).await,
        _ => run_batch(&manager, &cli).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

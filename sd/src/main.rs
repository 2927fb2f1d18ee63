//! solverd - admission-controlled LU solve daemon
//!
//! CLI entry point for submitting systems, running workers and inspecting tasks.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use solverd::cli::{Cli, Command, OutputFormat, colored_status};
use solverd::config::Config;
use solverd::domain::{Principal, TaskStatus, TransitionOutcome};
use solverd::service::{SolverService, SubmitRequest, TaskView};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = solverd::cli::get_log_path();
    let log_dir = log_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    info!(data_dir = %config.storage.data_dir.display(), "solverd loaded config");

    let service = SolverService::open(config).context("Failed to open solver service")?;
    let format = cli.format;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Submit {
            file,
            user,
            max_n,
            name,
            description,
            save_factors,
        } => {
            let request = SubmitRequest {
                name,
                description,
                save_factors,
                max_n,
            };
            cmd_submit(&service, &file, Principal::user(user), request, format).await
        }
        Command::Worker => cmd_worker(&service).await,
        Command::Status { id, identity } => cmd_status(&service, &id, &identity.principal(), format).await,
        Command::Cancel { id, identity } => cmd_cancel(&service, &id, &identity.principal(), format).await,
        Command::Watch { id, identity } => cmd_watch(&service, &id, &identity.principal(), format).await,
        Command::Progress { id, identity } => cmd_progress(&service, &id, &identity.principal(), format).await,
        Command::Logs { id, identity } => cmd_logs(&service, &id, &identity.principal(), format).await,
        Command::Capacity => cmd_capacity(&service, format).await,
        Command::List { status, identity } => cmd_list(&service, status, &identity.principal(), format).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_view(view: &TaskView) {
    let task = &view.task;
    println!("{} {}", "Task".bold(), task.id);
    println!("  Owner:   {}", task.owner);
    if let Some(name) = &task.name {
        println!("  Name:    {}", name);
    }
    println!("  Status:  {}", colored_status(task.status));
    if let Some(n) = task.matrix_size {
        println!("  Size:    {}x{}", n, n);
    }
    if let Some(position) = view.queue_position {
        println!("  Queue:   #{}", position);
    }
    if let Some(wait) = view.estimated_wait_secs {
        println!("  Wait:    ~{}s", wait);
    }
    if let Some(progress) = &view.latest_progress {
        println!("  Stage:   {} ({:.0}%)", progress.stage, progress.percentage);
    }
    if let Some(message) = &task.result_message {
        println!("  Message: {}", message);
    }
    if let Some(result) = &task.result_artifact {
        println!("  Result:  {}", result);
    }
    if let Some(factors) = &task.factor_artifacts {
        println!("  Factors: {} {} {}", factors.l, factors.u, factors.p);
    }
}

/// Submit a file and validate it right away
async fn cmd_submit(
    service: &SolverService,
    file: &Path,
    principal: Principal,
    request: SubmitRequest,
    format: OutputFormat,
) -> Result<()> {
    debug!(file = %file.display(), user = %principal.user_id, "cmd_submit: called");
    let text = fs::read_to_string(file).context(format!("Failed to read {}", file.display()))?;

    let receipt = service.submit(&principal, request).await?;
    let outcome = service.prepare(&receipt.id, &text).await?;
    debug!(?outcome, "cmd_submit: prepared");

    let view = service.detail(&principal, &receipt.id).await?;
    match format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Text => {
            if view.task.status == TaskStatus::Failed {
                println!("{} {}", "Rejected".red().bold(), view.task.id);
            } else {
                println!("{} {}", "Submitted".green().bold(), view.task.id);
            }
            print_view(&view);
        }
    }
    Ok(())
}

/// Run the scheduler and workers until Ctrl-C
async fn cmd_worker(service: &SolverService) -> Result<()> {
    debug!("cmd_worker: called");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
        let _ = shutdown_tx.send(true);
    });

    println!(
        "Worker running (global cap {}), press Ctrl-C to stop",
        service.config().admission.global_cap
    );
    service.run(shutdown_rx).await?;

    let stats = service.scheduler().stats().await;
    println!("Worker stopped after {} dispatches", stats.dispatched);
    service.state().shutdown().await?;
    Ok(())
}

async fn cmd_status(service: &SolverService, id: &str, principal: &Principal, format: OutputFormat) -> Result<()> {
    debug!(%id, "cmd_status: called");
    let view = service.detail(principal, id).await?;
    match format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Text => print_view(&view),
    }
    Ok(())
}

async fn cmd_cancel(service: &SolverService, id: &str, principal: &Principal, format: OutputFormat) -> Result<()> {
    debug!(%id, "cmd_cancel: called");
    let outcome = service.cancel(principal, id).await?;
    let (cancelled, message) = match outcome {
        TransitionOutcome::Applied(_) => (true, format!("Cancelled {}", id)),
        TransitionOutcome::AlreadyTerminal(status) => (false, format!("Task {} already {}", id, status)),
        TransitionOutcome::Rejected { from, to } => (false, format!("Task {} cannot move {} -> {}", id, from, to)),
    };
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "id": id, "cancelled": cancelled, "message": message }))?,
        OutputFormat::Text if cancelled => println!("{}", message.yellow()),
        OutputFormat::Text => println!("{}", message),
    }
    Ok(())
}

/// Print updates until the task reaches a terminal state
///
/// The worker usually runs in another process, so updates come from store
/// polling as well as the local bus.
async fn cmd_watch(service: &SolverService, id: &str, principal: &Principal, format: OutputFormat) -> Result<()> {
    debug!(%id, "cmd_watch: called");
    let mut updates = Box::pin(service.follow(principal, id).await?);

    while let Some(message) = updates.next().await {
        let event = message.event();
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&message)?),
            OutputFormat::Text => {
                print!("{} {:>6.1}%  {}", colored_status(event.status), event.percentage, event.stage);
                if let Some(position) = event.queue_position {
                    print!("  (queue #{})", position);
                }
                println!();
                if let Some(log) = &event.log {
                    println!("    {}", log.dimmed());
                }
                if let Some(message) = event.result_message.as_ref().filter(|_| event.status.is_terminal()) {
                    println!("    {}", message);
                }
            }
        }
        if event.status.is_terminal() {
            break;
        }
    }
    Ok(())
}

async fn cmd_progress(service: &SolverService, id: &str, principal: &Principal, format: OutputFormat) -> Result<()> {
    debug!(%id, "cmd_progress: called");
    let records = service.progress(principal, id).await?;
    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => {
            for record in records {
                println!("{:>6.1}%  {}", record.percentage, record.stage);
            }
        }
    }
    Ok(())
}

async fn cmd_logs(service: &SolverService, id: &str, principal: &Principal, format: OutputFormat) -> Result<()> {
    debug!(%id, "cmd_logs: called");
    let records = service.logs(principal, id).await?;
    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => {
            for record in records {
                let when = chrono::DateTime::from_timestamp_millis(record.timestamp)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let level = record.level.to_string();
                let level = match record.level {
                    solverd::domain::LogLevel::Info => level.normal(),
                    solverd::domain::LogLevel::Warn => level.yellow(),
                    solverd::domain::LogLevel::Error => level.red(),
                };
                println!("{} {:<5} {}", when, level, record.message);
            }
        }
    }
    Ok(())
}

async fn cmd_capacity(service: &SolverService, format: OutputFormat) -> Result<()> {
    debug!("cmd_capacity: called");
    let signal = service.capacity().await?;
    match format {
        OutputFormat::Json => print_json(&signal)?,
        OutputFormat::Text => {
            println!("Pending:  {}", signal.pending);
            println!("Queued:   {}", signal.queued);
            println!("Running:  {}", signal.running);
            println!("Backlog:  {}", signal.backlog);
            println!("Replicas: {}", signal.desired_replicas.to_string().bold());
        }
    }
    Ok(())
}

async fn cmd_list(
    service: &SolverService,
    status: Option<TaskStatus>,
    principal: &Principal,
    format: OutputFormat,
) -> Result<()> {
    debug!(?status, "cmd_list: called");
    let tasks = service.list(principal, status).await?;
    match format {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Text if tasks.is_empty() => {
            println!(
                "No tasks found{}",
                status.map(|s| format!(" with status '{}'", s)).unwrap_or_default()
            );
        }
        OutputFormat::Text => {
            println!("{:<38} {:<12} {:<10} {:<6}", "ID", "OWNER", "STATUS", "N");
            println!("{}", "-".repeat(70));
            for task in tasks {
                let n = task.matrix_size.map(|n| n.to_string()).unwrap_or_else(|| "-".into());
                // Pad before coloring so ANSI codes don't break alignment
                let status = format!("{:<10}", task.status.as_str());
                let status = match task.status {
                    TaskStatus::Completed => status.green(),
                    TaskStatus::Failed => status.red(),
                    TaskStatus::Running => status.cyan(),
                    TaskStatus::Queued => status.yellow(),
                    _ => status.normal(),
                };
                println!("{:<38} {:<12} {} {:<6}", task.id, task.owner, status, n);
            }
        }
    }
    Ok(())
}

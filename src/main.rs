//! Command-line entry point: index, query status and check paths for
//! sessions laid out under the configured sandbox root.

use workspace_indexer::{
    AuditSink, IndexRequest, IndexerConfig, IndexingService, IsolationDecision, JsonlAuditSink,
    SandboxSessionStore, TracingAuditSink,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "workspace-indexer", version, about = "Session-isolated workspace indexing")]
struct Cli {
    /// TOML configuration file. `WORKSPACE_INDEXER_*` variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Append audit events to this JSON-lines file instead of the log.
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    /// Also write logs to daily-rotated files in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialise and index a session's workspace.
    Index {
        #[arg(long)]
        session: String,
        /// Reuse an existing initialisation instead of forcing a rebuild.
        #[arg(long)]
        no_force: bool,
        /// Index-phase timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Report whether a session's workspace has been indexed.
    Status {
        #[arg(long)]
        session: String,
    },
    /// Check whether a session may access a path.
    CheckPath {
        #[arg(long)]
        session: String,
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_dir.as_deref())?;

    let config = IndexerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let sessions = Arc::new(SandboxSessionStore::new(config.workspace_root.clone()));
    let audit: Arc<dyn AuditSink> = match &cli.audit_log {
        Some(path) => Arc::new(JsonlAuditSink::new(path)),
        None => Arc::new(TracingAuditSink),
    };
    let service = IndexingService::new(config, sessions, audit)
        .context("failed to initialise indexing service")?;

    let succeeded = match cli.command {
        Command::Index {
            session,
            no_force,
            timeout,
        } => {
            let request = IndexRequest {
                force: !no_force,
                timeout: timeout.map(std::time::Duration::from_secs),
            };
            match service.index_workspace(&session, request).await {
                Ok(result) => {
                    print_json(&result.summary(&session))?;
                    result.is_completed()
                }
                Err(error) => {
                    print_error(&session, &error)?;
                    false
                }
            }
        }
        Command::Status { session } => match service.status(&session).await {
            Ok(report) => {
                print_json(&report)?;
                true
            }
            Err(error) => {
                print_error(&session, &error)?;
                false
            }
        },
        Command::CheckPath { session, path } => match service.check_path(&session, &path).await {
            IsolationDecision::Allow(resolved) => {
                print_json(&serde_json::json!({
                    "session_id": session,
                    "allowed": true,
                    "path": resolved.as_path(),
                    "exists": resolved.exists(),
                }))?;
                true
            }
            IsolationDecision::Deny(reason) => {
                print_json(&serde_json::json!({
                    "session_id": session,
                    "allowed": false,
                    "code": reason.code(),
                    "reason": reason.to_string(),
                }))?;
                false
            }
        },
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Stderr logging, plus a rolling file when `log_dir` is set. `RUST_LOG`
/// overrides the verbosity flag. The returned guard flushes the file writer
/// and must live until exit.
fn init_logging(verbose: u8, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_directives = match verbose {
        0 => "warn,workspace_indexer=info",
        1 => "info,workspace_indexer=debug",
        _ => "debug,workspace_indexer=trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "workspace-indexer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_error(session_id: &str, error: &workspace_indexer::Error) -> anyhow::Result<()> {
    print_json(&serde_json::json!({
        "session_id": session_id,
        "success": false,
        "code": error.code(),
        "error": error.to_string(),
    }))
}

//! warden - pipeline watchdog
//!
//! Runs the recovery, orphan and audit daemons, or any one of their passes
//! once from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use warden_audit::report::render_markdown;
use warden_core::{AuditType, WardenConfig};
use warden_daemon::{exit_code, telemetry, Runtime};

/// warden - keeps a staged worker pipeline moving
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level; overrides `logging.level`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every daemon until interrupted
    Run,
    /// Run one audit and print the result
    Audit {
        /// Audit type to request
        #[arg(long = "type", default_value = "full_system")]
        audit_type: String,
    },
    /// Run one recovery health check
    Recover,
    /// Run one orphan sweep
    Orphans,
    /// Collect infrastructure diagnostics
    Diagnose {
        /// Print JSON instead of markdown
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let outcome = run(Args::parse()).await;
    if let Err(e) = &outcome {
        tracing::error!(error = %e, "warden exited with an error");
        eprintln!("error: {e:#}");
    }
    std::process::exit(exit_code(&outcome));
}

async fn run(args: Args) -> Result<()> {
    let config = WardenConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let level = args.log_level.as_deref().unwrap_or(config.logging.level.as_str());
    telemetry::init(level, args.json_logs || config.logging.json)?;

    if matches!(args.command, Command::CheckConfig) {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let runtime = Runtime::build(config).await?;
    tracing::info!(version = warden_daemon::VERSION, command = ?args.command, "Starting warden");

    match args.command {
        Command::Run => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, shutting down");
                }
                on_signal.cancel();
            });
            runtime.run(cancel).await
        }
        Command::Audit { audit_type } => {
            let cancel = CancellationToken::new();
            let worker = runtime.spawn_audit_worker(cancel.clone());
            let outcome = runtime.audit_daemon().run_audit(AuditType::new(audit_type)).await;
            cancel.cancel();
            if let Some(worker) = worker {
                let _ = worker.await;
            }
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
            Ok(())
        }
        Command::Recover => {
            let report = runtime.recovery_daemon().check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Orphans => {
            let report = runtime.orphan_detector().sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Diagnose { json } => {
            let report = runtime.diagnostics().diagnose(None).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_markdown(&report));
            }
            Ok(())
        }
        Command::CheckConfig => Ok(()),
    }
}

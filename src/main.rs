//! cPanel full-backup runner
//!
//! Requests a full account backup, waits for the archive to appear in the home
//! directory and copies it to every configured cloud destination.

// panelbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod logging;
mod notify;
mod report;
mod retention;
mod transfer;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use config::AppConfig;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "panelbackup", version, about = "Automated cPanel full backup to S3, Google Drive and more")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Only upload to these destinations (repeatable). Others are reported as skipped.
    #[arg(short, long = "target", value_name = "NAME")]
    targets: Vec<String>,

    /// Write the run report as JSON to this file.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Look for an existing backup file and print it, without requesting a backup.
    #[arg(long)]
    dry_run_locate: bool,
}

/// Main entry point for the backup runner
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<u8> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let app_config = AppConfig::load_from_json(&args.config)
        .with_context(|| format!("Failed to load application configuration from {}", args.config.display()))?;
    logging::init(args.verbose, &app_config.log_dir);

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, app_config.run_timeout);

    if args.dry_run_locate {
        let artifact = backup::locate_only(&app_config, &cancel)
            .await
            .context("No backup file found")?;
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        return Ok(0);
    }

    info!(config = %args.config.display(), "🚀 Starting backup run");
    let report = backup::run_backup_flow(&app_config, &args.targets, &cancel)
        .await
        .context("Backup run could not be started")?;

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize run report")?;
    if let Some(path) = &args.report {
        tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    } else {
        println!("{}", json);
    }

    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(url) = &app_config.notify.webhook_url {
        match WebhookNotifier::new(url.clone()) {
            Ok(webhook) => notifiers.push(Box::new(webhook)),
            Err(err) => warn!(error = %format!("{:#}", err), "Webhook notifier disabled"),
        }
    }
    notify::notify_all(&notifiers, &report).await;

    Ok(report.overall_outcome.exit_code())
}

/// Cancels the run on Ctrl-C or once the optional overall time budget is spent.
fn spawn_cancel_triggers(cancel: &CancellationToken, run_timeout: Option<std::time::Duration>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    if let Some(budget) = run_timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            warn!(?budget, "Run time budget exhausted, cancelling run");
            on_timeout.cancel();
        });
    }
}

// panelbackup/src/logging.rs
use std::env;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_subscriber::{EnvFilter, Registry};

const LOG_FILE_PREFIX: &str = "panelbackup";
const LOG_FILE_SUFFIX: &str = "log";

/// Daily files kept before the oldest is removed.
const MAX_LOG_FILES: usize = 5;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Compact,
}

/// Console plus a daily rolling file under `log_dir`, capped at [`MAX_LOG_FILES`] files.
///
/// Falls back to console-only output when the log directory or file cannot be set up.
pub fn init(verbose: bool, log_dir: &Path) {
    let registry = Registry::default().with(build_filter(env::var("PANELBACKUP_LOG").ok(), verbose));
    let file_writer = build_file_writer(log_dir);

    match parse_format(env::var("PANELBACKUP_LOG_FORMAT").ok().as_deref()) {
        LogFormat::Json => {
            let stdout_layer = tracing_subscriber::fmt::layer().json();
            if let Some((writer, guard)) = file_writer {
                let file_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer);
                registry.with(stdout_layer).with(file_layer).init();
                let _ = FILE_GUARD.set(guard);
            } else {
                registry.with(stdout_layer).init();
            }
        }
        LogFormat::Compact => {
            let stdout_layer = tracing_subscriber::fmt::layer().compact();
            if let Some((writer, guard)) = file_writer {
                let file_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(writer);
                registry.with(stdout_layer).with(file_layer).init();
                let _ = FILE_GUARD.set(guard);
            } else {
                registry.with(stdout_layer).init();
            }
        }
    }
}

fn build_filter(directive: Option<String>, verbose: bool) -> EnvFilter {
    match directive.filter(|value| !value.trim().is_empty()) {
        Some(value) => EnvFilter::new(value),
        None if verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("info"),
    }
}

fn parse_format(value: Option<&str>) -> LogFormat {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}

fn build_file_writer(log_dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    if let Err(err) = std::fs::create_dir_all(log_dir) {
        eprintln!("⚠️ Could not create log directory {}: {}", log_dir.display(), err);
        return None;
    }
    match build_appender(log_dir) {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(err) => {
            eprintln!("⚠️ Could not open log file in {}: {}", log_dir.display(), err);
            None
        }
    }
}

fn build_appender(log_dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_compact() {
        assert_eq!(parse_format(None), LogFormat::Compact);
        assert_eq!(parse_format(Some(" JSON ")), LogFormat::Json);
        assert_eq!(parse_format(Some("pretty")), LogFormat::Compact);
    }

    #[test]
    fn filter_prefers_explicit_directive() {
        assert_eq!(build_filter(Some("warn".into()), true).to_string(), "warn");
        assert_eq!(build_filter(None, true).to_string(), "debug");
        assert_eq!(build_filter(Some("  ".into()), false).to_string(), "info");
    }

    #[test]
    fn appender_writes_prefixed_daily_file() -> anyhow::Result<()> {
        use std::io::Write;

        let dir = tempfile::tempdir()?;
        let mut appender = build_appender(dir.path())?;
        appender.write_all(b"run started\n")?;
        appender.flush()?;

        let names: Vec<String> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("panelbackup."));
        assert!(names[0].ends_with(".log"));
        Ok(())
    }

    #[test]
    fn unusable_log_dir_falls_back_to_console() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"")?;
        assert!(build_file_writer(&blocker.join("logs")).is_none());
        Ok(())
    }
}

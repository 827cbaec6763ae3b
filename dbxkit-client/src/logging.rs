use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    prelude::*,
    EnvFilter,
};

/// Default filter: client internals at debug, everything else at warn.
pub const DEFAULT_FILTER: &str = "dbxkit=debug,dbxkit_client=debug,dbxkit_transport=debug,dbxkit_core=debug,warn";

/// Where and how client logs are written.
///
/// Background session events are logged under the `dbxkit::background`
/// target, so an app that only cares about reconnection can filter on it.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub rotation: Rotation,
    /// Write the file as JSON lines instead of text.
    pub json: bool,
    /// Also write text to stderr.
    pub console: bool,
    pub default_filter: String,
    /// Let `RUST_LOG` replace `default_filter`.
    pub env_override: bool,
}

impl LogConfig {
    pub fn new(log_dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            file_prefix: file_prefix.into(),
            rotation: Rotation::DAILY,
            json: false,
            console: true,
            default_filter: DEFAULT_FILTER.to_string(),
            env_override: true,
        }
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn env_override(mut self, env_override: bool) -> Self {
        self.env_override = env_override;
        self
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        if self.env_override {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return Ok(filter);
            }
        }
        EnvFilter::try_new(&self.default_filter)
            .with_context(|| format!("invalid log filter {:?}", self.default_filter))
    }

    /// Build the subscriber without installing it.
    ///
    /// File output stops once the guard is dropped; pending lines are
    /// flushed first.
    pub fn subscriber(&self) -> anyhow::Result<(impl Subscriber + Send + Sync + 'static, WorkerGuard)> {
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("creating log directory {:?}", self.log_dir))?;
        let appender = RollingFileAppender::builder()
            .rotation(self.rotation.clone())
            .filename_prefix(self.file_prefix.clone())
            .build(&self.log_dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let console_layer = self.console.then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_writer(std::io::stderr)
        });
        let text_layer = (!self.json).then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(writer.clone())
        });
        let json_layer = self.json.then(|| {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_writer(writer)
        });

        let subscriber = tracing_subscriber::registry()
            .with(self.filter()?)
            .with(console_layer)
            .with(text_layer)
            .with(json_layer);
        Ok((subscriber, guard))
    }

    /// Install as the global subscriber. Keep the guard for the life of the app.
    pub fn init(&self) -> anyhow::Result<WorkerGuard> {
        let (subscriber, guard) = self.subscriber()?;
        subscriber.try_init()?;
        tracing::info!(log_dir = ?self.log_dir, json = self.json, "Logging initialized");
        Ok(guard)
    }
}

/// Text logs to stderr and a daily file under `log_dir`, for the whole process.
pub fn init_logging(log_dir: impl AsRef<Path>, log_prefix: &str) -> anyhow::Result<()> {
    let guard = LogConfig::new(log_dir.as_ref(), log_prefix).init()?;
    // The writer flushes until the process exits.
    std::mem::forget(guard);
    Ok(())
}

/// Console-only logging for tests; safe to call more than once.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dbxkit=trace,dbxkit_client=trace,debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn read_logs(dir: &Path) -> String {
        let mut contents = String::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            contents.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        contents
    }

    fn quiet(dir: &Path) -> LogConfig {
        LogConfig::new(dir.join("logs"), "dbxkit")
            .console(false)
            .env_override(false)
            .default_filter("dbxkit=debug,warn")
    }

    #[test]
    fn test_text_file_keeps_target_and_filters_others() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard) = quiet(dir.path()).subscriber().unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "dbxkit::background", count = 2, "Took pending reconnection requests");
            tracing::debug!(target: "hyper", "connection reused");
        });
        drop(guard);

        let contents = read_logs(&dir.path().join("logs"));
        assert!(contents.contains("dbxkit::background"));
        assert!(contents.contains("Took pending reconnection requests"));
        assert!(contents.contains("count=2"));
        assert!(!contents.contains("connection reused"));
        // No color codes in files.
        assert!(!contents.contains('\u{1b}'));
    }

    #[test]
    fn test_json_file_has_one_object_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard) = quiet(dir.path()).json(true).subscriber().unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "dbxkit::refresh", status = 400, "Token refresh rejected");
        });
        drop(guard);

        let contents = read_logs(&dir.path().join("logs"));
        let lines: Vec<Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["target"], "dbxkit::refresh");
        assert_eq!(lines[0]["level"], "WARN");
        assert_eq!(lines[0]["fields"]["message"], "Token refresh rejected");
        assert_eq!(lines[0]["fields"]["status"], 400);
    }

    #[test]
    fn test_invalid_default_filter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = quiet(dir.path()).default_filter("dbxkit=loud");
        assert!(config.subscriber().is_err());
    }

    #[test]
    fn test_init_logging_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");
        // Fails if a global subscriber is already set, after the directory exists.
        let _ = init_logging(&log_dir, "dbxkit");
        assert!(log_dir.is_dir());
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
    }
}

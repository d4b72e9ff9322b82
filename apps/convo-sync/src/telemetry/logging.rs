use clap::ValueEnum;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Full filter override, in `EnvFilter` syntax.
pub const FILTER_ENV: &str = "CONVO_LOG_FILTER";
/// Lets dependency crates log at trace level too.
pub const TRACE_DEPS_ENV: &str = "CONVO_TRACE_DEPS";

/// Targets raised to the requested level when it is debug or finer.
const OWN_TARGETS: &[&str] = &["convo_sync", "convo_tail", "convo_api", "broker_proto"];

/// Chatty transport and HTTP crates, capped at info unless asked for.
const NOISY_TARGETS: &[&str] = &[
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "hyper",
    "hyper_util",
    "h2",
    "rustls",
    "native_tls",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("logger already installed elsewhere: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber once. Later calls return `Ok(())` and keep
/// the first configuration.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (filter, capped) = match std::env::var(FILTER_ENV) {
        Ok(custom) => (custom, false),
        Err(_) => {
            let deps = super::flag(TRACE_DEPS_ENV).unwrap_or(false);
            let directives = directives(config.level, deps);
            let capped = config.level == LogLevel::Trace && !deps;
            (directives.join(","), capped)
        }
    };

    let (writer, guard) = writer(config.file.as_deref())?;
    let verbose = config.level >= LogLevel::Debug;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&filter))
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(verbose)
        .with_thread_ids(config.level == LogLevel::Trace)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    if GUARD.set(guard).is_err() {
        return Ok(());
    }
    tracing::debug!(
        target = "convo_sync::telemetry",
        filter = %filter,
        capped,
        "logging initialised"
    );
    Ok(())
}

fn writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = file else {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    };
    let file: File = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

/// Filter directives for `level`. Debug and trace raise only our own crates;
/// everything else stays at info.
fn directives(level: LogLevel, deps: bool) -> Vec<String> {
    if level < LogLevel::Debug {
        return vec![level.directive().to_string()];
    }
    let mut directives = vec!["info".to_string()];
    directives.extend(
        OWN_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.directive())),
    );
    if level == LogLevel::Trace && !deps {
        directives.extend(NOISY_TARGETS.iter().map(|target| format!("{target}=info")));
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_are_a_single_directive() {
        assert_eq!(directives(LogLevel::Warn, false), ["warn"]);
        assert_eq!(directives(LogLevel::Error, true), ["error"]);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }

    #[test]
    fn debug_raises_own_crates_only() {
        let directives = directives(LogLevel::Debug, false);
        assert_eq!(directives[0], "info");
        assert!(directives.contains(&"convo_sync=debug".to_string()));
        assert!(directives.contains(&"broker_proto=debug".to_string()));
        assert!(!directives.iter().any(|d| d.starts_with("tungstenite")));
    }

    #[test]
    fn trace_caps_dependencies_unless_allowed() {
        let capped = directives(LogLevel::Trace, false);
        assert!(capped.contains(&"convo_api=trace".to_string()));
        assert!(capped.contains(&"tungstenite=info".to_string()));
        assert!(capped.contains(&"reqwest=info".to_string()));

        let open = directives(LogLevel::Trace, true);
        assert!(!open.iter().any(|d| d.starts_with("reqwest")));
    }

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
    }
}

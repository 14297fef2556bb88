use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::env_truthy;

pub const LOG_FILTER_ENV: &str = "UPLINK_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "UPLINK_TRACE_DEPS";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if INIT.get().is_some() {
        return Ok(());
    }

    inner_init(config)?;
    INIT.set(()).ok();
    Ok(())
}

fn inner_init(config: &LogConfig) -> Result<(), InitError> {
    let (env_filter, muted_deps) = match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) => (EnvFilter::new(directives), false),
        Err(_) => {
            let plan = FilterPlan::for_level(config.level, env_truthy(TRACE_DEPS_ENV).unwrap_or(false));
            (EnvFilter::new(&plan.directives), plan.muted_deps)
        }
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if muted_deps {
        eprintln!(
            "[uplink-log] webrtc internals capped at info; set {TRACE_DEPS_ENV}=1 or {LOG_FILTER_ENV} to see them"
        );
    }
    Ok(())
}

/// Crates in this workspace; they follow the requested level.
const OWN_TARGETS: &[&str] = &["uplink", "uplink_session", "peer_transport", "transport_webrtc"];

/// The webrtc stack logs every SCTP chunk and ICE check at trace.
const NOISY_TARGETS: &[&str] = &["webrtc", "webrtc_ice", "webrtc_sctp", "webrtc_dtls", "webrtc_data", "mio"];

/// `EnvFilter` directives derived from the CLI level.
#[derive(Debug, PartialEq, Eq)]
struct FilterPlan {
    directives: String,
    muted_deps: bool,
}

impl FilterPlan {
    fn for_level(level: LogLevel, deps_allowed: bool) -> Self {
        if level < LogLevel::Debug {
            return Self {
                directives: level.directive().to_owned(),
                muted_deps: false,
            };
        }
        let muted_deps = level == LogLevel::Trace && !deps_allowed;
        let own = OWN_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.directive()));
        let capped = NOISY_TARGETS
            .iter()
            .filter(|_| muted_deps)
            .map(|target| format!("{target}=info"));
        let directives = std::iter::once("info".to_owned())
            .chain(own)
            .chain(capped)
            .collect::<Vec<_>>()
            .join(",");
        Self {
            directives,
            muted_deps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_caps_webrtc_unless_allowed() {
        let plan = FilterPlan::for_level(LogLevel::Trace, false);
        assert!(plan.muted_deps);
        assert!(plan.directives.starts_with("info,uplink=trace,uplink_session=trace"));
        assert!(plan.directives.ends_with("webrtc_data=info,mio=info"));

        let plan = FilterPlan::for_level(LogLevel::Trace, true);
        assert!(!plan.muted_deps);
        assert!(!plan.directives.contains("webrtc_sctp"));
    }

    #[test]
    fn debug_raises_only_our_crates() {
        let plan = FilterPlan::for_level(LogLevel::Debug, false);
        assert_eq!(
            plan.directives,
            "info,uplink=debug,uplink_session=debug,peer_transport=debug,transport_webrtc=debug"
        );
        assert!(!plan.muted_deps);
    }

    #[test]
    fn quieter_levels_are_a_single_directive() {
        assert_eq!(
            FilterPlan::for_level(LogLevel::Warn, false),
            FilterPlan {
                directives: "warn".into(),
                muted_deps: false,
            }
        );
        assert_eq!(FilterPlan::for_level(LogLevel::Error, true).directives, "error");
    }
}

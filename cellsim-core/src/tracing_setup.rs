//! Log routing for simulation runs.
//!
//! Kernel and multiplexer code log at fixed levels: `info!` for run
//! milestones, `debug!` for scheduling and admission decisions and `trace!`
//! once per data item. A console verbosity picks how much of that reaches the
//! terminal. The optional trace file keeps every decision, and per-item lines
//! only when asked for, since a long run produces one line per cell.
//!
//! Every run is wrapped in a [`run_span`] so that lines from concurrent or
//! repeated runs can be told apart by seed.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::clock::Tick;

/// Environment variable replacing the console filter.
pub const LOG_ENV: &str = "CELLSIM_LOG";

/// Default location of the trace file.
pub const DEFAULT_TRACE_FILE: &str = "logs/cellsim-last-run.log";

const CRATES: [&str; 3] = ["cellsim_core", "cellsim_mux", "cellsim_cli"];

/// How much of a run reaches the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Verbosity {
    /// Fatal errors only
    Errors,
    /// Errors and misconfiguration warnings
    #[default]
    Warnings,
    /// Run start, renormalization and summaries
    Summary,
    /// Scheduling and admission decisions
    Decisions,
    /// Every data item and event
    Items,
}

impl Verbosity {
    /// Filter directives: the simulator crates at this verbosity,
    /// dependencies never below `warn`.
    pub fn directives(self) -> String {
        let level = match self {
            Verbosity::Errors => "error",
            Verbosity::Warnings => "warn",
            Verbosity::Summary => "info",
            Verbosity::Decisions => "debug",
            Verbosity::Items => "trace",
        };
        let mut directives = String::from("warn");
        for name in CRATES {
            directives.push_str(&format!(",{name}={level}"));
        }
        directives
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOptions {
    /// Console verbosity; [`LOG_ENV`] overrides it when set
    pub console: Verbosity,
    /// Trace file, truncated on every run
    pub trace_file: Option<PathBuf>,
    /// Record per-item lines in the trace file
    pub item_detail: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            console: Verbosity::default(),
            trace_file: Some(PathBuf::from(DEFAULT_TRACE_FILE)),
            item_detail: false,
        }
    }
}

impl TraceOptions {
    /// Console only.
    pub fn console(console: Verbosity) -> Self {
        Self {
            console,
            trace_file: None,
            item_detail: false,
        }
    }

    /// Writes the trace to `path`.
    pub fn with_trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(path.into());
        self
    }

    /// Keeps per-item lines in the trace file.
    pub fn with_item_detail(mut self) -> Self {
        self.item_detail = true;
        self
    }

    fn file_verbosity(&self) -> Verbosity {
        if self.item_detail {
            Verbosity::Items
        } else {
            Verbosity::Decisions
        }
    }
}

/// Failure to install the subscriber.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Trace file or its directory could not be created
    #[error("cannot create trace file {path}: {source}")]
    TraceFile {
        /// Offending path
        path: PathBuf,
        /// Underlying failure
        source: std::io::Error,
    },

    /// Malformed filter in the environment
    #[error("invalid {LOG_ENV} filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed
    #[error(transparent)]
    AlreadyInstalled(#[from] TryInitError),
}

/// Installs the global subscriber. Returns the trace file in use, if any.
///
/// # Errors
///
/// - `TraceError::TraceFile` - If the trace file cannot be created
/// - `TraceError::Filter` - If [`LOG_ENV`] holds an unparsable filter
/// - `TraceError::AlreadyInstalled` - If a global subscriber is already installed
pub fn install(options: &TraceOptions) -> Result<Option<PathBuf>, TraceError> {
    let console_filter = match std::env::var(LOG_ENV) {
        Ok(directives) => {
            EnvFilter::try_new(&directives).map_err(|err| TraceError::Filter(err.to_string()))?
        }
        Err(_) => EnvFilter::new(options.console.directives()),
    };
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = match &options.trace_file {
        Some(path) => Some(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(open_trace_file(path)?)
                .with_filter(EnvFilter::new(options.file_verbosity().directives())),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        console = ?options.console,
        trace_file = ?options.trace_file,
        item_detail = options.item_detail,
        "tracing installed"
    );
    Ok(options.trace_file.clone())
}

fn open_trace_file(path: &Path) -> Result<File, TraceError> {
    let trace_file = |source| TraceError::TraceFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent).map_err(trace_file)?;
        }
    }
    File::create(path).map_err(trace_file)
}

/// Span wrapping one simulation run.
///
/// Carries the seed so that a run seen in the log can be replayed, and the
/// tick the run starts from so that resumed runs line up.
pub fn run_span(seed: u64, discipline: &str, start: Tick) -> Span {
    tracing::info_span!("run", seed, discipline, start)
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_verbosity_directives_spare_dependencies() {
        assert_eq!(
            Verbosity::Decisions.directives(),
            "warn,cellsim_core=debug,cellsim_mux=debug,cellsim_cli=debug"
        );
        assert_eq!(
            Verbosity::Errors.directives(),
            "warn,cellsim_core=error,cellsim_mux=error,cellsim_cli=error"
        );
        for verbosity in Verbosity::value_variants() {
            assert!(EnvFilter::try_new(verbosity.directives()).is_ok());
        }
    }

    #[test]
    fn test_verbosity_parses_from_command_line_names() {
        assert_eq!(
            Verbosity::from_str("summary", true),
            Ok(Verbosity::Summary)
        );
        assert_eq!(Verbosity::from_str("ITEMS", true), Ok(Verbosity::Items));
        assert!(Verbosity::from_str("loud", true).is_err());
    }

    #[test]
    fn test_trace_file_skips_items_unless_asked() {
        let options = TraceOptions::default();
        assert_eq!(options.file_verbosity(), Verbosity::Decisions);
        assert_eq!(
            options.with_item_detail().file_verbosity(),
            Verbosity::Items
        );
        assert_eq!(TraceOptions::console(Verbosity::Summary).trace_file, None);
    }

    #[test]
    fn test_trace_file_directory_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.log");
        open_trace_file(&path).unwrap();
        assert!(path.exists());

        let blocked = dir.path().join("nested").join("run.log").join("inner.log");
        assert!(matches!(
            open_trace_file(&blocked),
            Err(TraceError::TraceFile { .. })
        ));
    }

    #[test]
    fn test_install_records_run_span_in_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let options = TraceOptions::console(Verbosity::Errors).with_trace_file(&path);

        assert_eq!(install(&options).unwrap(), Some(path.clone()));
        {
            let _run = run_span(7, "fifo", 0).entered();
            tracing::debug!(queued = 3, "admitted");
        }

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.contains("tracing installed"));
        assert!(log.contains("seed=7"));
        assert!(log.contains("fifo"));
        assert!(matches!(
            install(&options),
            Err(TraceError::AlreadyInstalled(_))
        ));
    }
}

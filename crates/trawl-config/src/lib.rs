use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// Environment variable pointing at an explicit config file.
pub const TRAWL_CONFIG_ENV_VAR: &str = "TRAWL_CONFIG";

const CONFIG_FILE_NAMES: [&str; 2] = ["trawl.toml", ".trawl.toml"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrawlConfig {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    /// Endpoint spec of the remote searchers: a `k8s+` service URL or a space-separated list.
    #[serde(default = "SearchConfig::default_searcher_url")]
    pub searcher_url: String,

    /// Use the code index for revisions it covers.
    #[serde(default = "default_true")]
    pub index_enabled: bool,

    /// In-flight requests allowed per searcher replica.
    #[serde(default = "SearchConfig::default_fanout_factor")]
    pub fanout_factor: usize,

    /// Fetch timeout given to searchers when many repositories are searched at once.
    #[serde(default = "SearchConfig::default_many_repos_fetch_timeout_ms")]
    pub many_repos_fetch_timeout_ms: u64,

    /// Fetch timeout used when the query has no deadline.
    #[serde(default = "SearchConfig::default_fetch_timeout_ms")]
    pub default_fetch_timeout_ms: u64,

    /// Bound on listing the index catalog.
    #[serde(default = "SearchConfig::default_catalog_timeout_ms")]
    pub catalog_timeout_ms: u64,

    /// Bound on waiting for the first endpoint discovery result. Unset waits forever.
    #[serde(default)]
    pub discovery_ready_timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl SearchConfig {
    fn default_searcher_url() -> String {
        "k8s+http://searcher:3181".to_owned()
    }

    fn default_fanout_factor() -> usize {
        32
    }

    fn default_many_repos_fetch_timeout_ms() -> u64 {
        500
    }

    fn default_fetch_timeout_ms() -> u64 {
        60_000
    }

    fn default_catalog_timeout_ms() -> u64 {
        1_000
    }

    pub fn many_repos_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.many_repos_fetch_timeout_ms)
    }

    pub fn default_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.default_fetch_timeout_ms)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn discovery_ready_timeout(&self) -> Option<Duration> {
        self.discovery_ready_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            searcher_url: Self::default_searcher_url(),
            index_enabled: true,
            fanout_factor: Self::default_fanout_factor(),
            many_repos_fetch_timeout_ms: Self::default_many_repos_fetch_timeout_ms(),
            default_fetch_timeout_ms: Self::default_fetch_timeout_ms(),
            catalog_timeout_ms: Self::default_catalog_timeout_ms(),
            discovery_ready_timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr.
    #[serde(default = "default_true")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: `level`, with `RUST_LOG` merged in when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: true,
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep the message without the source snippet.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl TrawlConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: TrawlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let search = &self.search;
        if search.fanout_factor == 0 {
            return Err(ConfigError::Invalid(
                "search.fanout_factor must be at least 1".to_owned(),
            ));
        }
        if search.searcher_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "search.searcher_url must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Finds the config file for `dir`: `$TRAWL_CONFIG` if set, else `trawl.toml` or `.trawl.toml`
/// in `dir`.
pub fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(TRAWL_CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(path);
        return Some(if path.is_relative() { dir.join(path) } else { path });
    }
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Loads the discovered config for `dir`, or defaults when there is none.
pub fn load_for_dir(dir: &Path) -> Result<TrawlConfig, ConfigError> {
    match discover_config_path(dir) {
        Some(path) => TrawlConfig::load_from_path(path),
        None => Ok(TrawlConfig::default()),
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        // A panic while holding the lock only loses a partial log line.
        let guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        MutexFileWriter { guard }
    }
}

struct MutexFileWriter<'a> {
    guard: std::sync::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// Safe to call multiple times; only the first call installs a global subscriber.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if logging.stderr {
            // `cargo test` output capture only works for the stdlib's `print!/eprint!` macros.
            if cfg!(debug_assertions) {
                make_writer = BoxMakeWriter::new(
                    make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
                );
            } else {
                make_writer = BoxMakeWriter::new(make_writer.and(io::stderr));
            }
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter {
                file: Arc::new(Mutex::new(file)),
            }));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "trawl.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}

//! Configuration for workspace indexing.
//!
//! Loaded in layers with the `config` crate: built-in defaults, then an
//! optional TOML file, then `WORKSPACE_INDEXER_*` environment variables
//! (nested keys separated by `__`, e.g. `WORKSPACE_INDEXER_TOOL__PROGRAM`).
//! Everything is validated once, at construction.

use crate::process::DEFAULT_SCRUBBED_ENV;

use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "WORKSPACE_INDEXER";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The external indexing tool and its on-disk marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    /// Binary name or path.
    pub program: String,
    /// Arguments placed before the subcommand.
    pub args: Vec<String>,
    /// Directory the tool creates inside a workspace once initialised.
    pub marker_dir: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "mcp-vector-search".to_string(),
            args: Vec::new(),
            marker_dir: ".mcp-vector-search".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Sandbox root; every session workspace must live below it.
    pub workspace_root: PathBuf,
    pub init_timeout: Duration,
    /// Index-phase deadline when the caller doesn't ask for one.
    pub index_timeout: Duration,
    /// Longest index-phase deadline a caller may request.
    pub large_index_timeout: Duration,
    /// Shortest index-phase deadline a caller may request.
    pub min_index_timeout: Duration,
    pub tool: ToolConfig,
    /// Bytes kept per output stream of each phase.
    pub max_output_bytes: usize,
    /// Environment variables removed from the tool's environment.
    pub scrubbed_env: Vec<String>,
    pub allow_hidden_paths: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./content_sandboxes"),
            init_timeout: Duration::from_secs(30),
            index_timeout: Duration::from_secs(60),
            large_index_timeout: Duration::from_secs(600),
            min_index_timeout: Duration::from_secs(10),
            tool: ToolConfig::default(),
            max_output_bytes: 1024 * 1024,
            scrubbed_env: DEFAULT_SCRUBBED_ENV.iter().map(|var| var.to_string()).collect(),
            allow_hidden_paths: false,
        }
    }
}

/// File/env representation: timeouts in whole seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    workspace_root: PathBuf,
    init_timeout_secs: u64,
    index_timeout_secs: u64,
    large_index_timeout_secs: u64,
    min_index_timeout_secs: u64,
    tool: RawToolConfig,
    max_output_bytes: usize,
    scrubbed_env: Vec<String>,
    allow_hidden_paths: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawToolConfig {
    program: String,
    args: Vec<String>,
    marker_dir: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        let defaults = IndexerConfig::default();
        Self {
            workspace_root: defaults.workspace_root,
            init_timeout_secs: defaults.init_timeout.as_secs(),
            index_timeout_secs: defaults.index_timeout.as_secs(),
            large_index_timeout_secs: defaults.large_index_timeout.as_secs(),
            min_index_timeout_secs: defaults.min_index_timeout.as_secs(),
            tool: RawToolConfig::default(),
            max_output_bytes: defaults.max_output_bytes,
            scrubbed_env: defaults.scrubbed_env,
            allow_hidden_paths: defaults.allow_hidden_paths,
        }
    }
}

impl Default for RawToolConfig {
    fn default() -> Self {
        let tool = ToolConfig::default();
        Self {
            program: tool.program,
            args: tool.args,
            marker_dir: tool.marker_dir,
        }
    }
}

impl From<RawConfig> for IndexerConfig {
    fn from(raw: RawConfig) -> Self {
        Self {
            workspace_root: raw.workspace_root,
            init_timeout: Duration::from_secs(raw.init_timeout_secs),
            index_timeout: Duration::from_secs(raw.index_timeout_secs),
            large_index_timeout: Duration::from_secs(raw.large_index_timeout_secs),
            min_index_timeout: Duration::from_secs(raw.min_index_timeout_secs),
            tool: ToolConfig {
                program: raw.tool.program,
                args: raw.tool.args,
                marker_dir: raw.tool.marker_dir,
            },
            max_output_bytes: raw.max_output_bytes,
            scrubbed_env: raw.scrubbed_env,
            allow_hidden_paths: raw.allow_hidden_paths,
        }
    }
}

impl IndexerConfig {
    /// Load from an optional TOML file plus the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: config::Environment) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(env);

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        let config = IndexerConfig::from(raw);
        config.validate()?;

        tracing::debug!(
            workspace_root = %config.workspace_root.display(),
            tool = %config.tool.program,
            init_timeout_secs = config.init_timeout.as_secs(),
            index_timeout_secs = config.index_timeout.as_secs(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(invalid("workspace_root", "must not be empty"));
        }
        if self.tool.program.trim().is_empty() {
            return Err(invalid("tool.program", "must not be empty"));
        }

        let marker = Path::new(&self.tool.marker_dir);
        let mut components = marker.components();
        let single_name = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !single_name {
            return Err(invalid(
                "tool.marker_dir",
                "must be a single directory name inside the workspace",
            ));
        }

        for (field, value) in [
            ("init_timeout", self.init_timeout),
            ("index_timeout", self.index_timeout),
            ("min_index_timeout", self.min_index_timeout),
            ("large_index_timeout", self.large_index_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.min_index_timeout > self.large_index_timeout {
            return Err(invalid(
                "min_index_timeout",
                "must not exceed large_index_timeout",
            ));
        }
        if self.index_timeout < self.min_index_timeout
            || self.index_timeout > self.large_index_timeout
        {
            return Err(invalid(
                "index_timeout",
                "must lie between min_index_timeout and large_index_timeout",
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(invalid("max_output_bytes", "must be greater than zero"));
        }
        Ok(())
    }

    /// The index-phase deadline for a request. Out-of-range requests are
    /// rejected rather than clamped.
    pub fn index_timeout_for(&self, requested: Option<Duration>) -> crate::Result<Duration> {
        let Some(requested) = requested else {
            return Ok(self.index_timeout);
        };
        if requested < self.min_index_timeout || requested > self.large_index_timeout {
            return Err(crate::Error::InvalidTimeout {
                requested,
                min: self.min_index_timeout,
                max: self.large_index_timeout,
            });
        }
        Ok(requested)
    }
}

/// `WORKSPACE_INDEXER_TOOL__PROGRAM` maps to `tool.program`. List fields
/// take comma-separated values.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("scrubbed_env")
        .with_list_parse_key("tool.args")
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

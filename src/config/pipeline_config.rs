//! Pipeline configuration structs, loading and validation.

use super::defaults;
use super::validation::{find_unknown_keys, UnknownKey};
use crate::publish::{parse_waiting_period, CandidateFilter, VersionSelector};
use crate::types::ProductLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "STIX_PIPELINE_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "pipeline.toml";

// ============================================================================
// Top-level Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub pipeline: ProcessingConfig,
    pub publish: PublishConfig,
    pub aspect: AspectConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$STIX_PIPELINE_CONFIG`
    /// 2. `./pipeline.toml`
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded pipeline config from {}", CONFIG_ENV);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded pipeline config from ./{}", LOCAL_CONFIG);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG);
        Self::default()
    }

    /// Load from a specific TOML file. Unknown keys are reported as
    /// warnings, impossible values as errors.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        for key in find_unknown_keys(&contents) {
            warn!(path = %path.display(), "{}", key);
        }
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Unknown keys of the config file at `path`, for reporting outside
    /// the log.
    pub fn unknown_keys(path: &Path) -> Result<Vec<UnknownKey>, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(find_unknown_keys(&contents))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let p = &self.pipeline;

        if p.workers == 0 {
            errors.push("pipeline.workers must be > 0".to_string());
        }
        if p.batch_size == 0 {
            errors.push("pipeline.batch_size must be > 0".to_string());
        }
        if p.queue_capacity == 0 {
            errors.push("pipeline.queue_capacity must be > 0".to_string());
        }
        if p.poll_interval_secs == 0 {
            errors.push("pipeline.poll_interval_secs must be > 0".to_string());
        }
        if p.product_version == 0 {
            errors.push("pipeline.product_version must be >= 1".to_string());
        }
        if let Err(e) = regex::Regex::new(&p.tm_file_pattern) {
            errors.push(format!("pipeline.tm_file_pattern is not a valid regex: {}", e));
        }

        let pb = &self.publish;
        if pb.max_supplements == 0 {
            errors.push("publish.max_supplements must be > 0".to_string());
        }
        if parse_waiting_period(&pb.waiting_period).is_err() {
            errors.push(format!(
                "publish.waiting_period '{}' is not a duration like 14d, 12h, 30m or 0s",
                pb.waiting_period
            ));
        }
        if pb.version.parse::<VersionSelector>().is_err() {
            errors.push(format!(
                "publish.version '{}' must be 'latest' or a version number",
                pb.version
            ));
        }
        if pb.target_dir == pb.review_dir {
            errors.push("publish.review_dir must differ from publish.target_dir".to_string());
        }

        if self.aspect.batch_size == 0 {
            errors.push("aspect.batch_size must be > 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            errors.push(format!(
                "logging.format '{}' must be 'pretty' or 'json'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Candidate selection rules for the publish run.
    pub fn candidate_filter(&self) -> Result<CandidateFilter, ConfigError> {
        let pb = &self.publish;
        let waiting_period = parse_waiting_period(&pb.waiting_period)
            .map_err(|e| ConfigError::Validation(vec![e.to_string()]))?;
        let version = pb
            .version
            .parse()
            .map_err(|e: crate::publish::PublishError| ConfigError::Validation(vec![e.to_string()]))?;
        Ok(CandidateFilter {
            include_levels: pb.include_levels.clone(),
            include_types: pb.include_types.clone(),
            version,
            include_incomplete: pb.include_incomplete,
            waiting_period,
        })
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Incoming raw telemetry
    pub tm_dir: PathBuf,
    /// Root of the level-partitioned product archive
    pub archive_dir: PathBuf,
    /// Processing and publish ledgers
    pub ledger_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tm_dir: PathBuf::from(defaults::TM_DIR),
            archive_dir: PathBuf::from(defaults::ARCHIVE_DIR),
            ledger_dir: PathBuf::from(defaults::LEDGER_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub stop_on_error: bool,
    /// Version stamped on archived products
    pub product_version: u32,
    pub tm_file_pattern: String,
    pub poll_interval_secs: u64,
    pub settle_secs: u64,
    pub queue_capacity: usize,
    pub start_with_unprocessed: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: defaults::WORKERS,
            batch_size: defaults::BATCH_SIZE,
            stop_on_error: false,
            product_version: defaults::PRODUCT_VERSION,
            tm_file_pattern: defaults::TM_FILE_PATTERN.to_string(),
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            settle_secs: defaults::SETTLE_SECS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            start_with_unprocessed: false,
        }
    }
}

impl ProcessingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub target_dir: PathBuf,
    pub review_dir: PathBuf,
    pub waiting_period: String,
    pub include_levels: Vec<ProductLevel>,
    pub include_types: Vec<String>,
    /// `latest` or a version number
    pub version: String,
    pub include_incomplete: bool,
    pub blacklist_file: Option<PathBuf>,
    pub supplement_report: Option<PathBuf>,
    pub max_supplements: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            target_dir: PathBuf::from(defaults::TARGET_DIR),
            review_dir: PathBuf::from(defaults::REVIEW_DIR),
            waiting_period: defaults::WAITING_PERIOD.to_string(),
            include_levels: vec![ProductLevel::L1, ProductLevel::L2, ProductLevel::ANC],
            include_types: Vec::new(),
            version: "latest".to_string(),
            include_incomplete: false,
            blacklist_file: None,
            supplement_report: None,
            max_supplements: defaults::MAX_SUPPLEMENTS,
        }
    }
}

/// Settings for [`AspectStep`](crate::pipeline::AspectStep).
///
/// The solver is an external collaborator supplied by the embedding
/// program, so the binary has no aspect command; callers build the step
/// with `AspectStep::from_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AspectConfig {
    /// Housekeeping samples per solver call
    pub batch_size: usize,
}

impl Default for AspectConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::ASPECT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: defaults::LOG_FORMAT.to_string(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

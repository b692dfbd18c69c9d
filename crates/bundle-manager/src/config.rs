use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the bundle manager.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "bundles".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Decides how long opened bundles are kept around.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Keep up to `capacity` bundles open, closing the least recently used ones.
    Lru,
    /// Close bundles as soon as no request uses them anymore.
    Drain,
}

/// Fine-tuning of the open bundle cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The eviction policy.
    pub policy: CachePolicy,

    /// The number of bundles kept open by the [`Lru`](CachePolicy::Lru) policy.
    ///
    /// Bundles that are still in use when they are evicted stay open until they are released, so
    /// this bound can be exceeded temporarily.
    pub capacity: u64,

    /// The maximum time a query waits for its bundle to be opened.
    ///
    /// `null` waits for as long as it takes.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::Lru,
            capacity: 100,
            wait_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// The bundle manager configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The directory containing the bundle files.
    ///
    /// Bundles are stored as `dbs/<id>.lsif.db` within this directory.
    pub bundle_dir: PathBuf,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the cache of open bundles.
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bundle_dir: PathBuf::from("lsif-storage"),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

/// Parses a log level like `"info"` or `"TRACE"`. Unlike the `FromStr` impl of
/// [`LevelFilter`], numeric levels are rejected.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

    let level = String::deserialize(deserializer)?;
    if level.bytes().all(|b| b.is_ascii_digit()) {
        return Err(de::Error::unknown_variant(&level, LEVELS));
    }
    level
        .parse()
        .map_err(|_| de::Error::unknown_variant(&level, LEVELS))
}

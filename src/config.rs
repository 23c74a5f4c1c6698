use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
pub const DEFAULT_COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// Process-level settings, read from `CHAIRBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            compact_interval: DEFAULT_COMPACT_INTERVAL,
            metrics_port: None,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Malformed numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("CHAIRBOOK_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let compact_threshold = parse_or(
            lookup("CHAIRBOOK_COMPACT_THRESHOLD"),
            DEFAULT_COMPACT_THRESHOLD,
        );
        let interval_secs = parse_or(
            lookup("CHAIRBOOK_COMPACT_INTERVAL_SECS"),
            DEFAULT_COMPACT_INTERVAL.as_secs(),
        );
        let metrics_port = lookup("CHAIRBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok());

        Self {
            data_dir,
            compact_threshold,
            compact_interval: Duration::from_secs(interval_secs.max(1)),
            metrics_port,
        }
    }
}

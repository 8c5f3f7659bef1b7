use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, read from `RENTCAP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub admission_timeout: Duration,
    pub sweep_interval: Duration,
    /// WAL appends between automatic compactions.
    pub compact_threshold: u64,
    /// JSON seed for the in-memory stock adapter.
    pub stock_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            admission_timeout: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(60),
            compact_threshold: 1000,
            stock_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            data_dir: lookup("RENTCAP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("RENTCAP_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            admission_timeout: parsed("RENTCAP_ADMISSION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.admission_timeout),
            sweep_interval: parsed("RENTCAP_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: parsed("RENTCAP_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            stock_file: lookup("RENTCAP_STOCK_FILE").map(PathBuf::from),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

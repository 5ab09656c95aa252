use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

/// Engine configuration.
///
/// Resolution order: built-in defaults, then an optional TOML file, then
/// environment variables.
///
/// | Env Var | Default | Purpose |
/// |---------|---------|---------|
/// | `QUANTBACK_DB_URL` | `quantback.db` | Cache + report SQLite path |
/// | `QUANTBACK_JOB_TIMEOUT_SECS` | `600` | Per-job wall-clock budget |
/// | `QUANTBACK_USERCODE_TIMEOUT_MS` | `1000` | Per-user-call budget |
/// | `QUANTBACK_PANEL_WORKERS` | `4` | Parallelism for panel building |
/// | `QUANTBACK_LOT_SIZE` | `100` | Share lot size for buys |
/// | `QUANTBACK_DEFAULT_BENCHMARK` | `000300.SH` | Benchmark index code |
/// | `QUANTBACK_TRADING_DAYS_PER_YEAR` | `252` | Annualisation constant |
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub job_timeout: Duration,
    pub usercode_timeout: Duration,
    pub panel_workers: usize,
    pub lot_size: u32,
    pub default_benchmark: String,
    pub trading_days_per_year: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "quantback.db".to_string(),
            job_timeout: Duration::from_secs(600),
            usercode_timeout: Duration::from_millis(1000),
            panel_workers: 4,
            lot_size: 100,
            default_benchmark: "000300.SH".to_string(),
            trading_days_per_year: 252,
        }
    }
}

/// On-disk shape: `[db]` and `[job]` sections matching the documented
/// option names (`db.url`, `job.default_timeout_seconds`, ...).
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    db: DbSection,
    #[serde(default)]
    job: JobSection,
}

#[derive(Debug, Default, Deserialize)]
struct DbSection {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobSection {
    default_timeout_seconds: Option<u64>,
    usercode_timeout_ms: Option<u64>,
    panel_workers: Option<usize>,
    lot_size: Option<u32>,
    default_benchmark: Option<String>,
    trading_days_per_year: Option<u32>,
}

impl Config {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg
    }

    /// Defaults overridden by a TOML file, then by environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        let mut cfg = Config::default();
        cfg.apply_file(&file);
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_file(&mut self, file: &FileConfig) {
        if let Some(url) = &file.db.url {
            self.db_url = url.clone();
        }
        if let Some(secs) = file.job.default_timeout_seconds {
            self.job_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.job.usercode_timeout_ms {
            self.usercode_timeout = Duration::from_millis(ms);
        }
        if let Some(w) = file.job.panel_workers {
            self.panel_workers = w.max(1);
        }
        if let Some(lot) = file.job.lot_size {
            self.lot_size = lot.max(1);
        }
        if let Some(b) = &file.job.default_benchmark {
            self.default_benchmark = b.clone();
        }
        if let Some(d) = file.job.trading_days_per_year {
            self.trading_days_per_year = d.max(1);
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("QUANTBACK_DB_URL") {
            self.db_url = url;
        }
        if let Some(secs) = env_parse("QUANTBACK_JOB_TIMEOUT_SECS") {
            self.job_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("QUANTBACK_USERCODE_TIMEOUT_MS") {
            self.usercode_timeout = Duration::from_millis(ms);
        }
        if let Some(w) = env_parse::<usize>("QUANTBACK_PANEL_WORKERS") {
            self.panel_workers = w.max(1);
        }
        if let Some(lot) = env_parse::<u32>("QUANTBACK_LOT_SIZE") {
            self.lot_size = lot.max(1);
        }
        if let Ok(b) = std::env::var("QUANTBACK_DEFAULT_BENCHMARK") {
            self.default_benchmark = b;
        }
        if let Some(d) = env_parse::<u32>("QUANTBACK_TRADING_DAYS_PER_YEAR") {
            self.trading_days_per_year = d.max(1);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

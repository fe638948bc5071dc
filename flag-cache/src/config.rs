use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Directory holding the resolve cache snapshot and the apply ledger.
    #[envconfig(from = "FLAG_CACHE_STORAGE_DIR", default = ".flag-cache")]
    pub storage_dir: PathBuf,

    #[envconfig(from = "APPLY_URL", default = "http://localhost:8000/v1/flags:apply")]
    pub apply_url: String,

    #[envconfig(from = "CLIENT_SECRET", default = "")]
    pub client_secret: String,

    #[envconfig(from = "FLUSH_INTERVAL", default = "10000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "MAX_BATCH_SIZE", default = "200")]
    pub max_batch_size: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    pub fn resolve_cache_path(&self) -> PathBuf {
        self.storage_dir.join(RESOLVE_CACHE_FILE_NAME)
    }

    pub fn apply_ledger_path(&self) -> PathBuf {
        self.storage_dir.join(APPLY_LEDGER_FILE_NAME)
    }
}

pub const RESOLVE_CACHE_FILE_NAME: &str = "resolve_cache.json";
pub const APPLY_LEDGER_FILE_NAME: &str = "apply_ledger.json";

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "MAXIMUM_INTERVAL", default = "60000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "MAX_ATTEMPTS", default = "20")]
    pub maximum_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .maximum_attempts(self.maximum_attempts)
            .provide()
    }
}

use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::db;
use crate::services::queue::DEFAULT_VISIBILITY_TIMEOUT;
use crate::services::storage::S3Settings;
use crate::worker::{WorkerConfig, DEFAULT_BATCH_SIZE};

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Redis connection string for the job queue
    #[garde(length(min = 1))]
    pub queue_url: String,

    /// Redis list holding pending jobs
    #[serde(default = "default_queue_name")]
    #[garde(length(min = 1))]
    pub queue_name: String,

    /// Base URL of the image preprocessor
    #[garde(custom(http_url))]
    pub preprocessor_server_url: String,

    /// Optional API key sent with every preprocessor request
    #[garde(skip)]
    pub salad_api_key: Option<String>,

    /// Status table name
    #[garde(custom(table_name))]
    pub job_table: String,

    /// PostgreSQL connection string for the status table
    #[garde(length(min = 1))]
    pub database_url: String,

    /// S3 endpoint URL. AWS when unset.
    #[garde(skip)]
    pub s3_endpoint: Option<String>,

    #[serde(default = "default_s3_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    /// S3 access key ID. The default credential chain is used when unset.
    #[garde(skip)]
    pub s3_access_key: Option<String>,

    /// S3 secret access key
    #[garde(skip)]
    pub s3_secret_key: Option<String>,

    /// Use path-style bucket addressing (LocalStack, MinIO)
    #[serde(default)]
    #[garde(skip)]
    pub s3_path_style: bool,

    /// Maximum messages per batch
    #[serde(default = "default_batch_size")]
    #[garde(range(min = 1, max = 100))]
    pub batch_size: usize,

    /// Long-poll wait for a batch, in seconds
    #[serde(default = "default_wait_time_seconds")]
    #[garde(range(min = 1))]
    pub wait_time_seconds: u64,

    /// Preprocessor request timeout, in seconds
    #[serde(default = "default_transform_timeout_seconds")]
    #[garde(range(min = 1))]
    pub transform_timeout_seconds: u64,

    /// Bind address for /health and /metrics (e.g., "0.0.0.0:9090"). Disabled when unset.
    #[garde(skip)]
    pub metrics_addr: Option<String>,

    /// Seconds a received message stays hidden before it is redelivered.
    /// Must outlast a job, including the preprocessor request timeout.
    #[serde(default = "default_visibility_timeout_seconds")]
    #[garde(range(min = 1))]
    pub visibility_timeout_seconds: u64,
}

fn default_queue_name() -> String {
    "preprocessor:jobs".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_wait_time_seconds() -> u64 {
    20
}

fn default_transform_timeout_seconds() -> u64 {
    300
}

fn default_visibility_timeout_seconds() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT.as_secs()
}

fn http_url(value: &str, _ctx: &()) -> garde::Result {
    match reqwest::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => Err(garde::Error::new(format!(
            "unsupported scheme {:?}",
            url.scheme()
        ))),
        Err(e) => Err(garde::Error::new(format!("not a URL: {e}"))),
    }
}

fn table_name(value: &str, _ctx: &()) -> garde::Result {
    if db::is_valid_table_name(value) {
        Ok(())
    } else {
        Err(garde::Error::new("not a valid SQL table name"))
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_config(envy::from_env()?)
    }

    /// Load from explicit key/value pairs (upper-case keys, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::from_config(envy::from_iter(vars)?)
    }

    fn from_config(config: Self) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(config)
    }

    /// The API key, ignoring an empty value.
    pub fn api_key(&self) -> Option<&str> {
        self.salad_api_key.as_deref().filter(|key| !key.is_empty())
    }

    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs(self.transform_timeout_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            wait_time: Duration::from_secs(self.wait_time_seconds),
            ..WorkerConfig::default()
        }
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone().filter(|e| !e.is_empty()),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            path_style: self.s3_path_style,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

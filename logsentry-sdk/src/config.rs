use std::env;
use std::time::Duration;

use crate::credentials::Credentials;

/// Compile-time default server URL, overridden by `LOGSENTRY_URL`.
pub const DEFAULT_DSN: &str = "https://api.logsentry.io";

/// Records per flush, clamped to `[1, 1000]`.
const BATCH_SIZE_RANGE: (usize, usize) = (1, 1000);

/// Flush interval in seconds, clamped to `[0.1, 60]`.
const FLUSH_INTERVAL_RANGE: (f64, f64) = (0.1, 60.0);

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_FLUSH_INTERVAL: f64 = 5.0;

/// An error raised by [`init`](crate::init).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InitError {
    /// No API key was passed, found in the environment, or stored in the
    /// local credentials file.
    #[error(
        "api_key is required. Run `logsentry-sdk init` or pass api_key explicitly"
    )]
    MissingCredentials,

    /// The resolved API key does not look like a key.
    #[error("api_key must start with `sk_`")]
    MalformedApiKey,
}

/// Options accepted by [`init`](crate::init).
///
/// All fields are optional; unset fields resolve from the environment, then
/// the local credentials file, then compile-time defaults.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// The API key authenticating this app.
    pub api_key: Option<String>,
    /// Base URL of the ingest server.
    pub dsn: Option<String>,
    /// Records per flush.
    pub batch_size: Option<usize>,
    /// Soft upper bound on record age in the buffer.
    pub flush_interval: Option<Duration>,
    /// Hard cap on buffered records. Defaults to ten batches.
    pub max_buffer: Option<usize>,
    /// Minimum level captured by the log tap.
    pub max_level: Option<tracing::Level>,
}

/// Fully resolved SDK configuration.
#[derive(Clone, Debug)]
pub struct SdkConfig {
    /// The API key authenticating this app.
    pub api_key: String,
    /// Base URL of the ingest server, without a trailing slash.
    pub dsn: String,
    /// Records per flush.
    pub batch_size: usize,
    /// Soft upper bound on record age in the buffer.
    pub flush_interval: Duration,
    /// Hard cap on buffered records.
    pub max_buffer: usize,
    /// Minimum level captured by the log tap.
    pub max_level: tracing::Level,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

impl SdkConfig {
    /// Resolves options against the environment and local credentials.
    ///
    /// Precedence per field: explicit option, then `LOGSENTRY_*` environment
    /// variable, then the credentials file (for key and DSN), then the
    /// built-in default.
    pub fn resolve(options: Options) -> Result<Self, InitError> {
        let credentials = Credentials::load();

        let api_key = options
            .api_key
            .or_else(|| env::var("LOGSENTRY_API_KEY").ok())
            .or_else(|| credentials.as_ref().map(|c| c.api_key.clone()))
            .filter(|key| !key.is_empty())
            .ok_or(InitError::MissingCredentials)?;

        if !api_key.starts_with("sk_") {
            return Err(InitError::MalformedApiKey);
        }

        let dsn = options
            .dsn
            .or_else(|| env::var("LOGSENTRY_URL").ok())
            .or_else(|| credentials.as_ref().map(|c| c.dsn.clone()))
            .unwrap_or_else(|| DEFAULT_DSN.to_owned());

        let batch_size = options
            .batch_size
            .or_else(|| env_parse("LOGSENTRY_BATCH_SIZE"))
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .clamp(BATCH_SIZE_RANGE.0, BATCH_SIZE_RANGE.1);

        let flush_interval = options
            .flush_interval
            .map(|interval| interval.as_secs_f64())
            .or_else(|| env_parse("LOGSENTRY_FLUSH_INTERVAL"))
            .unwrap_or(DEFAULT_FLUSH_INTERVAL)
            .clamp(FLUSH_INTERVAL_RANGE.0, FLUSH_INTERVAL_RANGE.1);

        let max_buffer = options
            .max_buffer
            .or_else(|| env_parse("LOGSENTRY_MAX_BUFFER"))
            .unwrap_or(batch_size * 10)
            .max(batch_size);

        Ok(Self {
            api_key,
            dsn: dsn.trim_end_matches('/').to_owned(),
            batch_size,
            flush_interval: Duration::from_secs_f64(flush_interval),
            max_buffer,
            max_level: options.max_level.unwrap_or(tracing::Level::INFO),
        })
    }

    /// The full URL of the ingest endpoint.
    pub fn ingest_url(&self) -> String {
        format!("{}/ingest", self.dsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_key() -> Options {
        Options {
            api_key: Some("sk_0123456789abcdef0123456789abcdef".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_credentials() {
        // Note: assumes LOGSENTRY_API_KEY is unset in the test environment.
        let result = SdkConfig::resolve(Options {
            api_key: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(result.unwrap_err(), InitError::MissingCredentials);
    }

    #[test]
    fn test_malformed_key() {
        let result = SdkConfig::resolve(Options {
            api_key: Some("pk_whatever".to_owned()),
            ..Default::default()
        });
        assert_eq!(result.unwrap_err(), InitError::MalformedApiKey);
    }

    #[test]
    fn test_defaults_and_clamps() {
        let config = SdkConfig::resolve(options_with_key()).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.max_buffer, 500);

        let config = SdkConfig::resolve(Options {
            batch_size: Some(50_000),
            flush_interval: Some(Duration::from_millis(1)),
            max_buffer: Some(1),
            ..options_with_key()
        })
        .unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.flush_interval, Duration::from_secs_f64(0.1));
        // The buffer can never hold less than one batch.
        assert_eq!(config.max_buffer, 1000);
    }

    #[test]
    fn test_dsn_trailing_slash() {
        let config = SdkConfig::resolve(Options {
            dsn: Some("http://localhost:8001/".to_owned()),
            ..options_with_key()
        })
        .unwrap();
        assert_eq!(config.ingest_url(), "http://localhost:8001/ingest");
    }
}

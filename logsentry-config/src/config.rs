use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use logsentry_metrics::AggregateConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to open the file.
    #[error("could not open config file {1:?}")]
    CouldNotOpenFile(#[source] io::Error, PathBuf),

    /// Failed to write the file.
    #[error("could not write config file {1:?}")]
    CouldNotWriteFile(#[source] io::Error, PathBuf),

    /// Parsing YAML failed.
    #[error("could not parse yaml config file {1:?}")]
    BadYaml(#[source] serde_yaml::Error, PathBuf),

    /// Parsing JSON failed.
    #[error("could not parse json config")]
    BadJson(#[source] serde_json::Error),

    /// Invalid value in a field override.
    #[error("invalid config value for field {0}")]
    InvalidValue(&'static str),
}

enum ConfigFormat {
    Yaml,
}

impl ConfigFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yml",
        }
    }
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The format in which to serialize this configuration.
    fn format() -> ConfigFormat;

    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.{}", Self::name(), Self::format().extension()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::CouldNotOpenFile(e, path.clone()))?;

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::BadYaml(e, path)),
        }
    }

    /// Writes the configuration to a file within the given directory location.
    fn save(&self, base: &Path) -> Result<(), ConfigError> {
        let path = Self::path(base);
        let mut options = fs::OpenOptions::new();
        options.write(true).truncate(true).create(true);

        // Remove all non-user permissions for the newly created file.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut f = options
            .open(&path)
            .map_err(|e| ConfigError::CouldNotWriteFile(e, path.clone()))?;

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::to_writer(&mut f, self)
                .map_err(|e| ConfigError::BadYaml(e, path.clone()))?,
        }

        f.write_all(b"\n").ok();
        Ok(())
    }
}

/// Configuration overrides from CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The host the server should bind to.
    pub host: Option<String>,
    /// The port to bind for the HTTP server.
    pub port: Option<String>,
    /// The URL of the SQLite document store.
    pub database_url: Option<String>,
    /// The externally visible base URL of this server.
    pub public_url: Option<String>,
    /// The per-installation API key pepper.
    pub key_pepper: Option<String>,
    /// Hostname and port of the statsd server.
    pub statsd: Option<String>,
}

/// General server settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Server {
    /// The host the server should bind to (network interface).
    host: IpAddr,
    /// The port to bind for the HTTP server.
    port: u16,
    /// The externally visible base URL of this server.
    ///
    /// Used to build the verification URL returned by the device
    /// authorization flow. Defaults to the bind address.
    public_url: Option<String>,
    /// The grace period for graceful shutdown, in seconds.
    shutdown_timeout: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".parse().unwrap(),
            port: 8001,
            public_url: None,
            shutdown_timeout: 10,
        }
    }
}

/// Control the statsd metrics.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables metric reporting.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    sample_rate: f32,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "logsentry".into(),
            default_tags: BTreeMap::new(),
            sample_rate: 1.0,
        }
    }
}

/// Controls ingest limits and timeouts.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// The maximum payload size of an ingest envelope in bytes.
    max_envelope_bytes: usize,
    /// The maximum number of records in an ingest envelope.
    max_batch_records: usize,
    /// Capacity of each per-app processing channel, in records.
    per_app_channel_records: usize,
    /// How long the ingest endpoint waits for room in a full per-app channel
    /// before returning backpressure, in milliseconds.
    enqueue_timeout_ms: u64,
    /// The value of the `Retry-After` header on backpressure responses, in
    /// seconds.
    retry_after_secs: u64,
    /// Request timeout of the ingest endpoint, in seconds.
    ingest_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_envelope_bytes: 1024 * 1024,
            max_batch_records: 1000,
            per_app_channel_records: 1024,
            enqueue_timeout_ms: 250,
            retry_after_secs: 1,
            ingest_timeout_secs: 10,
        }
    }
}

/// Controls the per-app processing pipeline.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Processing {
    /// Base URL of the external classifier. `None` disables classification.
    classifier_url: Option<String>,
    /// Timeout for a single classifier call, in seconds.
    classifier_timeout_secs: u64,
    /// Maximum number of concurrent classifier calls across all apps.
    classifier_concurrency: usize,
    /// Flush the write batch to the store at this many pending records.
    write_batch_max_records: usize,
    /// Flush the write batch when the oldest pending record reaches this age,
    /// in seconds.
    write_batch_max_delay_secs: u64,
    /// Timeout for a single store write, in seconds.
    store_write_timeout_secs: u64,
    /// Consecutive store write failures after which the processor degrades to
    /// the on-disk spool.
    max_write_failures: u32,
}

impl Default for Processing {
    fn default() -> Self {
        Self {
            classifier_url: None,
            classifier_timeout_secs: 2,
            classifier_concurrency: 16,
            write_batch_max_records: 200,
            write_batch_max_delay_secs: 2,
            store_write_timeout_secs: 5,
            max_write_failures: 10,
        }
    }
}

/// Controls the document store.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct StoreConfig {
    /// SQLite database URL of the document store.
    database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://logsentry.db?mode=rwc".into(),
        }
    }
}

/// Controls the degraded-mode disk spool.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Spool {
    /// Path of the spool database.
    path: PathBuf,
    /// Maximum on-disk size of the spool in bytes. Oldest records are dropped
    /// once the cap is reached.
    max_bytes: u64,
}

impl Default for Spool {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logsentry-spool.db"),
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Controls the device authorization flow.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct DeviceAuth {
    /// Lifetime of a device session, in seconds. Hard-capped at 15 minutes.
    session_ttl_secs: u64,
    /// The poll interval communicated to clients, in seconds. Polling faster
    /// than this is rejected per device code.
    poll_interval_secs: u64,
    /// Interval of the expired-session janitor, in seconds.
    janitor_interval_secs: u64,
    /// Timeout for device session store operations, in seconds.
    session_op_timeout_secs: u64,
}

impl Default for DeviceAuth {
    fn default() -> Self {
        Self {
            session_ttl_secs: 600,
            poll_interval_secs: 2,
            janitor_interval_secs: 30,
            session_op_timeout_secs: 1,
        }
    }
}

/// Controls API key hashing and the lookup cache.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Auth {
    /// The per-installation pepper mixed into at-rest key hashes.
    ///
    /// Changing this invalidates every issued API key. The development
    /// default must be overridden in production setups.
    key_pepper: String,
    /// How long a failed key lookup is cached, in seconds.
    negative_cache_ttl_secs: u64,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            key_pepper: "insecure-dev-pepper".into(),
            negative_cache_ttl_secs: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct ConfigValues {
    server: Server,
    logging: logsentry_log::LogConfig,
    metrics: Metrics,
    limits: Limits,
    processing: Processing,
    store: StoreConfig,
    spool: Spool,
    device_auth: DeviceAuth,
    auth: Auth,
    aggregates: AggregateConfig,
}

impl ConfigObject for ConfigValues {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Loads a config from the given config folder.
    ///
    /// A missing `config.yml` yields the defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = if ConfigValues::path(&path).exists() {
            ConfigValues::load(&path)?
        } else {
            ConfigValues::default()
        };

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value).map_err(ConfigError::BadJson)?,
            path: PathBuf::new(),
        })
    }

    /// Writes the current config values back to the config folder.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.values.save(&self.path)
    }

    /// Overrides configuration with values from other sources (e.g. env
    /// variables or command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let server = &mut self.values.server;

        if let Some(host) = overrides.host {
            server.host = host
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidValue("host"))?;
        }

        if let Some(port) = overrides.port {
            server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("port"))?;
        }

        if overrides.public_url.is_some() {
            server.public_url = overrides.public_url;
        }

        if let Some(database_url) = overrides.database_url {
            self.values.store.database_url = database_url;
        }

        if let Some(pepper) = overrides.key_pepper {
            self.values.auth.key_pepper = pepper;
        }

        if overrides.statsd.is_some() {
            self.values.metrics.statsd = overrides.statsd;
        }

        Ok(self)
    }

    /// Returns the config folder this config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the socket address the HTTP server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        (self.values.server.host, self.values.server.port).into()
    }

    /// Returns the externally visible base URL of this server.
    pub fn public_url(&self) -> String {
        match &self.values.server.public_url {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => format!("http://{}", self.listen_addr()),
        }
    }

    /// Returns the grace period for graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.server.shutdown_timeout)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &logsentry_log::LogConfig {
        &self.values.logging
    }

    /// Returns the statsd address if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix for all statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags applied to all statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the global statsd sample rate.
    pub fn metrics_sample_rate(&self) -> f32 {
        self.values.metrics.sample_rate
    }

    /// Returns the maximum ingest envelope size in bytes.
    pub fn max_envelope_bytes(&self) -> usize {
        self.values.limits.max_envelope_bytes
    }

    /// Returns the maximum number of records per ingest envelope.
    pub fn max_batch_records(&self) -> usize {
        self.values.limits.max_batch_records
    }

    /// Returns the capacity of each per-app channel in records.
    pub fn per_app_channel_records(&self) -> usize {
        self.values.limits.per_app_channel_records.max(1024)
    }

    /// Returns how long the ingest endpoint waits for channel capacity.
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.values.limits.enqueue_timeout_ms)
    }

    /// Returns the `Retry-After` value for backpressure responses in seconds.
    pub fn retry_after_secs(&self) -> u64 {
        self.values.limits.retry_after_secs.max(1)
    }

    /// Returns the request timeout of the ingest endpoint.
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.ingest_timeout_secs)
    }

    /// Returns the classifier base URL if classification is enabled.
    pub fn classifier_url(&self) -> Option<&str> {
        self.values.processing.classifier_url.as_deref()
    }

    /// Returns the timeout for one classifier call.
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.values.processing.classifier_timeout_secs)
    }

    /// Returns the maximum number of concurrent classifier calls.
    pub fn classifier_concurrency(&self) -> usize {
        self.values.processing.classifier_concurrency.max(1)
    }

    /// Returns the record count that triggers a write batch flush.
    pub fn write_batch_max_records(&self) -> usize {
        self.values.processing.write_batch_max_records.max(1)
    }

    /// Returns the age of the oldest pending write that triggers a flush.
    pub fn write_batch_max_delay(&self) -> Duration {
        Duration::from_secs(self.values.processing.write_batch_max_delay_secs)
    }

    /// Returns the timeout for a single store write.
    pub fn store_write_timeout(&self) -> Duration {
        Duration::from_secs(self.values.processing.store_write_timeout_secs)
    }

    /// Returns the failure count after which a processor degrades.
    pub fn max_write_failures(&self) -> u32 {
        self.values.processing.max_write_failures.max(1)
    }

    /// Returns the SQLite URL of the document store.
    pub fn store_url(&self) -> &str {
        &self.values.store.database_url
    }

    /// Returns the path of the degraded-mode spool database.
    pub fn spool_path(&self) -> &Path {
        &self.values.spool.path
    }

    /// Returns the maximum on-disk size of the spool in bytes.
    pub fn spool_max_bytes(&self) -> u64 {
        self.values.spool.max_bytes
    }

    /// Returns the lifetime of a device session.
    ///
    /// Clamped to the protocol maximum of 15 minutes.
    pub fn device_session_ttl(&self) -> Duration {
        Duration::from_secs(self.values.device_auth.session_ttl_secs.min(15 * 60))
    }

    /// Returns the poll interval communicated to device-auth clients.
    ///
    /// A zero interval disables the poll rate limit.
    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_secs(self.values.device_auth.poll_interval_secs)
    }

    /// Returns the interval of the expired-session janitor.
    pub fn device_janitor_interval(&self) -> Duration {
        Duration::from_secs(self.values.device_auth.janitor_interval_secs.max(1))
    }

    /// Returns the timeout for device session store operations.
    pub fn device_session_op_timeout(&self) -> Duration {
        Duration::from_secs(self.values.device_auth.session_op_timeout_secs.max(1))
    }

    /// Returns the per-installation API key pepper.
    pub fn key_pepper(&self) -> &[u8] {
        self.values.auth.key_pepper.as_bytes()
    }

    /// Returns how long failed key lookups are cached.
    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.values.auth.negative_cache_ttl_secs)
    }

    /// Returns the rolling aggregate configuration.
    pub fn aggregates(&self) -> &AggregateConfig {
        &self.values.aggregates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr().port(), 8001);
        assert_eq!(config.max_envelope_bytes(), 1024 * 1024);
        assert_eq!(config.max_batch_records(), 1000);
        assert_eq!(config.device_session_ttl(), Duration::from_secs(600));
        assert_eq!(config.aggregates().window_count(), 360);
        assert_eq!(config.negative_cache_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_session_ttl_is_capped() {
        let config = Config::from_json_value(serde_json::json!({
            "device_auth": {"session_ttl_secs": 3600}
        }))
        .unwrap();

        assert_eq!(config.device_session_ttl(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_window_count_is_capped() {
        let config = Config::from_json_value(serde_json::json!({
            "aggregates": {"window_count": 100000}
        }))
        .unwrap();

        assert_eq!(config.aggregates().window_count(), 360);
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                host: Some("127.0.0.1".into()),
                port: Some("9001".into()),
                public_url: Some("https://logs.example.com/".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.public_url(), "https://logs.example.com");
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.listen_addr().port(), 8001);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_path(dir.path()).unwrap();
        config
            .apply_override(OverridableConfig {
                port: Some("9100".into()),
                ..Default::default()
            })
            .unwrap();
        config.save().unwrap();

        let reloaded = Config::from_path(dir.path()).unwrap();
        assert_eq!(reloaded.listen_addr().port(), 9100);
    }
}

//! Driver config params file and the tunables it controls.
//!
//! The file is the driver's ConfigMap projected into the pod. It is read once
//! at startup (errors are fatal) and then polled for changes; a bad edit is
//! logged and the previous values stay in force.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{Error, Result};
use crate::Mode;

pub const ARRAY_CONNECTIVITY_POLL_RATE: &str = "PODMON_ARRAY_CONNECTIVITY_POLL_RATE";
pub const ARRAY_CONNECTIVITY_CONNECTION_LOSS_THRESHOLD: &str =
    "PODMON_ARRAY_CONNECTIVITY_CONNECTION_LOSS_THRESHOLD";
pub const SKIP_ARRAY_CONNECTION_VALIDATION: &str = "PODMON_SKIP_ARRAY_CONNECTION_VALIDATION";
pub const CONTROLLER_LOG_FORMAT: &str = "PODMON_CONTROLLER_LOG_FORMAT";
pub const CONTROLLER_LOG_LEVEL: &str = "PODMON_CONTROLLER_LOG_LEVEL";
pub const NODE_LOG_FORMAT: &str = "PODMON_NODE_LOG_FORMAT";
pub const NODE_LOG_LEVEL: &str = "PODMON_NODE_LOG_LEVEL";

/// Reload handle for the global log filter.
pub type LogHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("text") {
            LogFormat::Text
        } else {
            if !value.eq_ignore_ascii_case("json") {
                warn!(format = %value, "Unexpected log format, using json");
            }
            LogFormat::Json
        }
    }
}

/// Fixed timeouts and retry delays.
#[derive(Debug, Clone)]
pub struct Timings {
    pub short_timeout: Duration,
    pub medium_timeout: Duration,
    pub long_timeout: Duration,
    pub pending_retry: Duration,
    pub api_check_interval: Duration,
    pub api_check_retry_timeout: Duration,
    pub api_check_first_try_timeout: Duration,
    pub monitor_restart_delay: Duration,
    pub driver_dial_retry: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            short_timeout: Duration::from_secs(10),
            medium_timeout: Duration::from_secs(30),
            long_timeout: Duration::from_secs(180),
            pending_retry: Duration::from_secs(30),
            api_check_interval: Duration::from_secs(30),
            api_check_retry_timeout: Duration::from_secs(10),
            api_check_first_try_timeout: Duration::from_secs(30),
            monitor_restart_delay: Duration::from_secs(10),
            driver_dial_retry: Duration::from_secs(30),
        }
    }
}

/// Values read on the hot path; swapped field by field on reload.
#[derive(Debug)]
pub struct Tunables {
    poll_rate_ms: AtomicU64,
    loss_threshold: AtomicU32,
    skip_array_connection_validation: AtomicBool,
}

impl Tunables {
    pub fn new(poll_rate: Duration, loss_threshold: u32, skip_validation: bool) -> Self {
        Self {
            poll_rate_ms: AtomicU64::new(poll_rate.as_millis() as u64),
            loss_threshold: AtomicU32::new(loss_threshold),
            skip_array_connection_validation: AtomicBool::new(skip_validation),
        }
    }

    pub fn poll_rate(&self) -> Duration {
        Duration::from_millis(self.poll_rate_ms.load(Ordering::Relaxed))
    }

    pub fn set_poll_rate(&self, rate: Duration) {
        self.poll_rate_ms
            .store(rate.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn loss_threshold(&self) -> u32 {
        self.loss_threshold.load(Ordering::Relaxed)
    }

    pub fn set_loss_threshold(&self, threshold: u32) {
        self.loss_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn skip_array_connection_validation(&self) -> bool {
        self.skip_array_connection_validation
            .load(Ordering::Relaxed)
    }

    pub fn set_skip_array_connection_validation(&self, skip: bool) {
        self.skip_array_connection_validation
            .store(skip, Ordering::Relaxed);
    }
}

/// CLI values a key falls back to when the file does not set it.
#[derive(Debug, Clone)]
pub struct ConfigDefaults {
    pub poll_rate_secs: u64,
    pub loss_threshold: u32,
    pub skip_array_connection_validation: bool,
    pub log_level: String,
}

/// Parsed contents of the config params file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverConfig {
    pub poll_rate_secs: Option<u64>,
    pub loss_threshold: Option<u32>,
    pub skip_array_connection_validation: Option<bool>,
    pub log_format: Option<LogFormat>,
    pub log_level: Option<String>,
}

impl DriverConfig {
    /// Parse the YAML document, picking the logging keys for `mode`.
    pub fn parse(content: &str, mode: Mode) -> Result<Self> {
        let values = read_values(content)?;
        let (format_key, level_key) = match mode {
            Mode::Node => (NODE_LOG_FORMAT, NODE_LOG_LEVEL),
            Mode::Controller | Mode::Standalone => (CONTROLLER_LOG_FORMAT, CONTROLLER_LOG_LEVEL),
        };

        let mut config = DriverConfig::default();

        if let Some(raw) = values.get(ARRAY_CONNECTIVITY_POLL_RATE) {
            config.poll_rate_secs = Some(parse_positive(ARRAY_CONNECTIVITY_POLL_RATE, raw)?);
        }
        if let Some(raw) = values.get(ARRAY_CONNECTIVITY_CONNECTION_LOSS_THRESHOLD) {
            let value = parse_positive(ARRAY_CONNECTIVITY_CONNECTION_LOSS_THRESHOLD, raw)?;
            config.loss_threshold = Some(u32::try_from(value).map_err(|_| Error::Config {
                key: ARRAY_CONNECTIVITY_CONNECTION_LOSS_THRESHOLD.to_string(),
                value: raw.clone(),
            })?);
        }
        if let Some(raw) = values.get(SKIP_ARRAY_CONNECTION_VALIDATION) {
            config.skip_array_connection_validation =
                Some(parse_bool(SKIP_ARRAY_CONNECTION_VALIDATION, raw)?);
        }
        if let Some(raw) = values.get(format_key) {
            config.log_format = Some(LogFormat::parse(raw));
        }
        if let Some(raw) = values.get(level_key) {
            if !raw.is_empty() {
                config.log_level = Some(parse_level(level_key, raw)?);
            }
        }

        Ok(config)
    }

    pub fn read(path: &Path, mode: Mode) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&content, mode)
    }
}

/// Flatten the YAML map to strings; scalars of any type are accepted.
fn read_values(content: &str) -> Result<BTreeMap<String, String>> {
    let doc: Option<BTreeMap<String, serde_yaml::Value>> =
        serde_yaml::from_str(content).map_err(|e| Error::ConfigFile {
            path: "<contents>".to_string(),
            message: e.to_string(),
        })?;

    let mut values = BTreeMap::new();
    for (key, value) in doc.unwrap_or_default() {
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                debug!(key = %key, value = ?other, "Ignoring non-scalar config value");
                continue;
            }
        };
        values.insert(key, text.trim().to_string());
    }
    Ok(values)
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::Config {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "t" => Ok(true),
        "false" | "0" | "f" => Ok(false),
        _ => Err(Error::Config {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Normalise a level name into an `EnvFilter` directive.
fn parse_level(key: &str, raw: &str) -> Result<String> {
    let level = match raw.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "fatal" | "panic" => "error",
        _ => {
            return Err(Error::Config {
                key: key.to_string(),
                value: raw.to_string(),
            })
        }
    };
    Ok(level.to_string())
}

/// Applies the config file to the running process and keeps it current.
pub struct ConfigWatcher {
    path: PathBuf,
    mode: Mode,
    defaults: ConfigDefaults,
    tunables: Arc<Tunables>,
    log_handle: Option<LogHandle>,
    log_format: LogFormat,
}

impl ConfigWatcher {
    pub fn new(
        path: PathBuf,
        mode: Mode,
        defaults: ConfigDefaults,
        tunables: Arc<Tunables>,
        log_format: LogFormat,
    ) -> Self {
        Self {
            path,
            mode,
            defaults,
            tunables,
            log_handle: None,
            log_format,
        }
    }

    pub fn with_log_handle(mut self, handle: LogHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    /// Read the file and apply it. Nothing is applied unless every key parses.
    pub fn reload(&self) -> Result<DriverConfig> {
        let config = DriverConfig::read(&self.path, self.mode)?;
        self.apply(&config);
        Ok(config)
    }

    fn apply(&self, config: &DriverConfig) {
        let poll_rate = config.poll_rate_secs.unwrap_or(self.defaults.poll_rate_secs);
        self.tunables.set_poll_rate(Duration::from_secs(poll_rate));

        let threshold = config
            .loss_threshold
            .unwrap_or(self.defaults.loss_threshold);
        self.tunables.set_loss_threshold(threshold);

        let skip = config
            .skip_array_connection_validation
            .unwrap_or(self.defaults.skip_array_connection_validation);
        self.tunables.set_skip_array_connection_validation(skip);

        if let Some(format) = config.log_format {
            if format != self.log_format {
                warn!(
                    format = ?format,
                    current = ?self.log_format,
                    "Log format change takes effect on restart"
                );
            }
        }

        let level = config
            .log_level
            .clone()
            .unwrap_or_else(|| self.defaults.log_level.clone());
        if let Some(handle) = &self.log_handle {
            if let Err(e) = handle.reload(EnvFilter::new(&level)) {
                warn!(error = %e, "Failed to update log level");
            }
        }

        info!(
            poll_rate_secs = poll_rate,
            loss_threshold = threshold,
            skip_array_connection_validation = skip,
            log_level = %level,
            "configuration has been set"
        );
    }

    /// Poll the file's modification time and reapply it on change.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut last_modified = modified_time(&self.path);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let modified = modified_time(&self.path);
            if modified == last_modified {
                continue;
            }
            last_modified = modified;

            info!(file = %self.path.display(), "configuration file has changed");
            if let Err(e) = self.reload() {
                warn!(error = %e, "Ignoring invalid configuration, keeping previous values");
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

//! Resilience settings loader
//!
//! Loads policy and circuit-breaker settings from environment variables or
//! files and turns them into validated configs.
//!
//! ## Loading Strategy
//! 1. If any `CARELINK_RESILIENCE_*` variable is set, settings come from the
//!    environment
//! 2. Otherwise the first settings file found is parsed
//! 3. Otherwise the built-in defaults apply
//!
//! ## Environment Variables
//! - `CARELINK_RESILIENCE_FAILURE_THRESHOLD`: Consecutive failures that open a
//!   breaker
//! - `CARELINK_RESILIENCE_SUCCESS_THRESHOLD`: Trial successes that close it
//! - `CARELINK_RESILIENCE_OPEN_TIMEOUT_MS`: Time an open breaker waits before
//!   probing
//! - `CARELINK_RESILIENCE_HALF_OPEN_MAX_REQUESTS`: Concurrent trials
//! - `CARELINK_RESILIENCE_<POLICY>_MAX_ATTEMPTS`
//! - `CARELINK_RESILIENCE_<POLICY>_INITIAL_DELAY_MS`
//! - `CARELINK_RESILIENCE_<POLICY>_MAX_DELAY_MS`
//! - `CARELINK_RESILIENCE_<POLICY>_JITTER` (true/false)
//! - `CARELINK_RESILIENCE_<POLICY>_ATTEMPT_TIMEOUT_MS`
//!
//! where `<POLICY>` is `AGGRESSIVE`, `STANDARD` or `CONSERVATIVE`.
//! Per-operation overrides are only available from files.
//!
//! ## File Locations
//! Searched in order: `./resilience.toml`, `./resilience.json`,
//! `./config/resilience.toml`, `./config/resilience.json`.
//!
//! ## File Format
//! ```toml
//! [circuit_breaker]
//! failure_threshold = 5
//! open_timeout_ms = 60000
//!
//! [policies.aggressive]
//! max_attempts = 6
//!
//! [operations.inference.retry]
//! max_attempts = 2
//! retryable_errors = ["timeout"]
//!
//! [operations.inference.urgency.5]
//! initial_delay_ms = 50
//!
//! [operations.inference.circuit_breaker]
//! failure_threshold = 3
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use crate::error::{ConfigError, FailureKind};
use crate::policy::{PolicyName, RetryPolicyRegistry, Urgency};

/// Prefix shared by every environment variable
pub const ENV_PREFIX: &str = "CARELINK_RESILIENCE_";

/// File names searched by [`find_settings_paths`], relative to a base directory
pub const SETTINGS_FILE_CANDIDATES: [&str; 4] = [
    "resilience.toml",
    "resilience.json",
    "config/resilience.toml",
    "config/resilience.json",
];

/// Errors from loading or applying settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Settings file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid {format} format in {path}: {message}")]
    Parse { path: PathBuf, format: &'static str, message: String },

    #[error("Unsupported settings format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SettingsError {
    fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue { key: key.into(), message: message.into() }
    }
}

//==============================================================================
// Settings types
//==============================================================================

/// Partial retry configuration; unset fields keep the base config's value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    #[serde(rename = "initial_delay_ms", with = "crate::utils::serde::option_duration_millis")]
    pub initial_delay: Option<Duration>,
    #[serde(rename = "max_delay_ms", with = "crate::utils::serde::option_duration_millis")]
    pub max_delay: Option<Duration>,
    pub backoff_base: Option<f64>,
    pub backoff_strategy: Option<BackoffStrategy>,
    pub jitter: Option<bool>,
    pub retryable_errors: Option<Vec<FailureKind>>,
    pub excluded_errors: Option<Vec<FailureKind>>,
    #[serde(rename = "attempt_timeout_ms", with = "crate::utils::serde::option_duration_millis")]
    pub attempt_timeout: Option<Duration>,
}

impl RetrySettings {
    /// Overlay these settings on `base` and validate the result
    pub fn apply_to(&self, base: &RetryConfig) -> Result<RetryConfig, ConfigError> {
        let mut builder = base.to_builder();
        if let Some(attempts) = self.max_attempts {
            builder = builder.max_attempts(attempts);
        }
        if let Some(delay) = self.initial_delay {
            builder = builder.initial_delay(delay);
        }
        if let Some(delay) = self.max_delay {
            builder = builder.max_delay(delay);
        }
        if let Some(base) = self.backoff_base {
            builder = builder.backoff_base(base);
        }
        if let Some(strategy) = self.backoff_strategy {
            builder = builder.backoff_strategy(strategy);
        }
        if let Some(jitter) = self.jitter {
            builder = builder.jitter(jitter);
        }
        if let Some(kinds) = &self.retryable_errors {
            builder = builder.retryable_errors(kinds.iter().cloned());
        }
        if let Some(kinds) = &self.excluded_errors {
            builder = builder.excluded_errors(kinds.iter().cloned());
        }
        if let Some(timeout) = self.attempt_timeout {
            builder = builder.attempt_timeout(timeout);
        }
        builder.build()
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl TryFrom<&RetrySettings> for RetryConfig {
    type Error = ConfigError;

    fn try_from(settings: &RetrySettings) -> Result<Self, Self::Error> {
        settings.apply_to(&RetryConfig::default())
    }
}

/// Partial circuit-breaker configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    #[serde(rename = "open_timeout_ms", with = "crate::utils::serde::option_duration_millis")]
    pub open_timeout: Option<Duration>,
    pub half_open_max_requests: Option<u32>,
}

impl CircuitBreakerSettings {
    /// Overlay these settings on `base` and validate the result
    pub fn apply_to(
        &self,
        base: &CircuitBreakerConfig,
    ) -> Result<CircuitBreakerConfig, ConfigError> {
        let mut builder = base.to_builder();
        if let Some(threshold) = self.failure_threshold {
            builder = builder.failure_threshold(threshold);
        }
        if let Some(threshold) = self.success_threshold {
            builder = builder.success_threshold(threshold);
        }
        if let Some(timeout) = self.open_timeout {
            builder = builder.open_timeout(timeout);
        }
        if let Some(max_requests) = self.half_open_max_requests {
            builder = builder.half_open_max_requests(max_requests);
        }
        builder.build()
    }
}

impl TryFrom<&CircuitBreakerSettings> for CircuitBreakerConfig {
    type Error = ConfigError;

    fn try_from(settings: &CircuitBreakerSettings) -> Result<Self, Self::Error> {
        settings.apply_to(&CircuitBreakerConfig::default())
    }
}

/// Overrides for one operation id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperationSettings {
    /// Layered on each urgency's own tier, and on `Standard` for the default
    /// selector. `jitter` is ignored for urgency 5.
    pub retry: Option<RetrySettings>,
    /// Keyed by urgency `"1"`..`"5"`, layered on top of `retry`
    pub urgency: BTreeMap<String, RetrySettings>,
    /// Layered on the global breaker settings
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

/// Everything the resilience layer reads from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    /// Defaults for every breaker
    pub circuit_breaker: CircuitBreakerSettings,
    /// Named tier overrides keyed by `aggressive`, `standard`, `conservative`
    pub policies: BTreeMap<String, RetrySettings>,
    /// Per-operation overrides keyed by operation id
    pub operations: BTreeMap<String, OperationSettings>,
}

impl ResilienceSettings {
    /// Breaker configuration used for operations without an override
    pub fn circuit_breaker_defaults(&self) -> Result<CircuitBreakerConfig, SettingsError> {
        Ok(CircuitBreakerConfig::try_from(&self.circuit_breaker)?)
    }

    /// Per-operation breaker configurations, layered on the defaults
    pub fn circuit_breaker_overrides(
        &self,
    ) -> Result<Vec<(String, CircuitBreakerConfig)>, SettingsError> {
        let defaults = self.circuit_breaker_defaults()?;
        self.operations
            .iter()
            .filter_map(|(operation_id, op)| {
                op.circuit_breaker.map(|breaker| (operation_id, breaker))
            })
            .map(|(operation_id, breaker)| {
                let config = breaker.apply_to(&defaults).map_err(|e| {
                    SettingsError::invalid_value(
                        format!("operations.{operation_id}.circuit_breaker"),
                        e.to_string(),
                    )
                })?;
                Ok((operation_id.clone(), config))
            })
            .collect()
    }

    /// Build a policy registry with every tier and operation override applied
    pub fn to_registry(&self) -> Result<RetryPolicyRegistry, SettingsError> {
        let mut registry = RetryPolicyRegistry::new();
        for (name, settings) in &self.policies {
            let policy: PolicyName = name.parse()?;
            let config = settings.apply_to(&policy.default_config()).map_err(|e| {
                SettingsError::invalid_value(format!("policies.{name}"), e.to_string())
            })?;
            registry = registry.with_named(policy, config).map_err(|e| {
                SettingsError::invalid_value(format!("policies.{name}"), e.to_string())
            })?;
        }

        for (operation_id, op) in &self.operations {
            let retry_key = format!("operations.{operation_id}.retry");
            let retry = op.retry.as_ref().filter(|retry| !retry.is_empty());
            if let Some(retry) = retry {
                let config = retry
                    .apply_to(&registry.named(PolicyName::Standard))
                    .map_err(|e| SettingsError::invalid_value(retry_key.clone(), e.to_string()))?;
                registry.register_operation(operation_id.clone(), config);
            }

            let mut sections = BTreeMap::new();
            for (level, section) in &op.urgency {
                let key = format!("operations.{operation_id}.urgency.{level}");
                let urgency = parse_urgency(level)
                    .map_err(|message| SettingsError::invalid_value(key.clone(), message))?;
                sections.insert(urgency, (key, section));
            }

            for urgency in Urgency::all() {
                let section = sections.get(&urgency);
                if retry.is_none() && section.is_none() {
                    continue;
                }

                let mut config = registry.named(urgency.policy()).as_ref().clone();
                if let Some(retry) = retry {
                    let overlay = if urgency == Urgency::EMERGENCY {
                        RetrySettings { jitter: None, ..retry.clone() }
                    } else {
                        retry.clone()
                    };
                    config = overlay.apply_to(&config).map_err(|e| {
                        SettingsError::invalid_value(retry_key.clone(), e.to_string())
                    })?;
                }
                let key = section.map_or_else(|| retry_key.clone(), |(key, _)| key.clone());
                if let Some((_, section)) = section {
                    config = section
                        .apply_to(&config)
                        .map_err(|e| SettingsError::invalid_value(key.clone(), e.to_string()))?;
                }
                registry
                    .register_operation_urgency(operation_id.clone(), urgency, config)
                    .map_err(|e| SettingsError::invalid_value(key, e.to_string()))?;
            }
        }

        Ok(registry)
    }

    /// Check that every section converts to a valid config
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.to_registry()?;
        self.circuit_breaker_overrides()?;
        Ok(())
    }
}

fn parse_urgency(level: &str) -> Result<Urgency, String> {
    let level: u8 = level.trim().parse().map_err(|e| format!("not an urgency level: {e}"))?;
    Urgency::new(level).map_err(|e| e.to_string())
}

//==============================================================================
// Loading
//==============================================================================

/// Load settings with automatic fallback strategy
///
/// # Errors
/// Returns an error if a present source is unreadable or invalid. Missing
/// sources fall through to the defaults.
pub fn load() -> Result<ResilienceSettings, SettingsError> {
    if let Some(settings) = load_from_env()? {
        tracing::info!("Resilience settings loaded from environment variables");
        return Ok(settings);
    }

    match find_settings_paths() {
        Some(path) => load_from_file(&path),
        None => {
            tracing::debug!("No resilience settings found, using defaults");
            Ok(ResilienceSettings::default())
        }
    }
}

/// Load settings from the process environment
///
/// Returns `Ok(None)` when no `CARELINK_RESILIENCE_*` variable is set.
pub fn load_from_env() -> Result<Option<ResilienceSettings>, SettingsError> {
    load_from_env_with(|key| std::env::var(key).ok())
}

/// Load settings through an arbitrary variable lookup
pub fn load_from_env_with<F>(lookup: F) -> Result<Option<ResilienceSettings>, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup, found: std::cell::Cell::new(false) };
    let mut settings = ResilienceSettings::default();

    settings.circuit_breaker = CircuitBreakerSettings {
        failure_threshold: env.parse("FAILURE_THRESHOLD")?,
        success_threshold: env.parse("SUCCESS_THRESHOLD")?,
        open_timeout: env.millis("OPEN_TIMEOUT_MS")?,
        half_open_max_requests: env.parse("HALF_OPEN_MAX_REQUESTS")?,
    };

    for policy in PolicyName::ALL {
        let prefix = policy.as_str().to_ascii_uppercase();
        let retry = RetrySettings {
            max_attempts: env.parse(&format!("{prefix}_MAX_ATTEMPTS"))?,
            initial_delay: env.millis(&format!("{prefix}_INITIAL_DELAY_MS"))?,
            max_delay: env.millis(&format!("{prefix}_MAX_DELAY_MS"))?,
            jitter: env.bool(&format!("{prefix}_JITTER"))?,
            attempt_timeout: env.millis(&format!("{prefix}_ATTEMPT_TIMEOUT_MS"))?,
            ..RetrySettings::default()
        };
        if !retry.is_empty() {
            settings.policies.insert(policy.as_str().to_string(), retry);
        }
    }

    if !env.found.get() {
        return Ok(None);
    }
    settings.validate()?;
    Ok(Some(settings))
}

struct EnvReader<F> {
    lookup: F,
    found: std::cell::Cell<bool>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, suffix: &str) -> Option<(String, String)> {
        let key = format!("{ENV_PREFIX}{suffix}");
        let value = (self.lookup)(&key)?;
        self.found.set(true);
        Some((key, value))
    }

    fn parse<T>(&self, suffix: &str) -> Result<Option<T>, SettingsError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(suffix)
            .map(|(key, value)| {
                value
                    .trim()
                    .parse::<T>()
                    .map_err(|e| SettingsError::invalid_value(key, e.to_string()))
            })
            .transpose()
    }

    fn millis(&self, suffix: &str) -> Result<Option<Duration>, SettingsError> {
        Ok(self.parse::<u64>(suffix)?.map(Duration::from_millis))
    }

    /// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
    fn bool(&self, suffix: &str) -> Result<Option<bool>, SettingsError> {
        self.raw(suffix)
            .map(|(key, value)| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(SettingsError::invalid_value(key, format!("not a boolean: {other}"))),
            })
            .transpose()
    }
}

/// Load and validate settings from a file
///
/// Format is detected by extension (`.toml` or `.json`).
pub fn load_from_file(path: &Path) -> Result<ResilienceSettings, SettingsError> {
    if !path.exists() {
        return Err(SettingsError::NotFound(path.to_path_buf()));
    }

    tracing::info!(path = %path.display(), "Loading resilience settings from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|source| SettingsError::Io { path: path.to_path_buf(), source })?;
    let settings = parse_settings(&contents, path)?;
    settings.validate()?;
    Ok(settings)
}

/// Parse settings from string content, using `path` for format detection
pub fn parse_settings(contents: &str, path: &Path) -> Result<ResilienceSettings, SettingsError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents).map_err(|e| SettingsError::Parse {
            path: path.to_path_buf(),
            format: "TOML",
            message: e.to_string(),
        }),
        "json" => serde_json::from_str(contents).map_err(|e| SettingsError::Parse {
            path: path.to_path_buf(),
            format: "JSON",
            message: e.to_string(),
        }),
        other => Err(SettingsError::UnsupportedFormat(other.to_string())),
    }
}

/// First settings file found under the current directory
pub fn find_settings_paths() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_settings_paths_in(&cwd)
}

/// First settings file found under `base`
pub fn find_settings_paths_in(base: &Path) -> Option<PathBuf> {
    SETTINGS_FILE_CANDIDATES.iter().map(|name| base.join(name)).find(|path| path.exists())
}

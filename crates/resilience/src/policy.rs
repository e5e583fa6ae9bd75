//! Urgency-tiered retry policies
//!
//! [`RetryPolicyRegistry`] resolves an operation identifier plus a
//! [`PolicySelector`] to an immutable [`RetryConfig`]. Three named tiers
//! ship by default:
//!
//! | Policy | Urgency | max_attempts | initial_delay | max_delay | jitter | attempt timeout |
//! |---|---|---|---|---|---|---|
//! | `Aggressive` | 5 | 5 | 100 ms | 2 s | off | 5 s |
//! | `Standard` | 3-4 | 4 | 500 ms | 10 s | on | 15 s |
//! | `Conservative` | 1-2 | 3 | 1 s | 30 s | on | 30 s |
//!
//! Lookup order for an urgency selector is: `(operation, urgency)` override,
//! operation-wide override, then the tier for that urgency. Operation-wide
//! overrides never apply to urgency 5, and no configuration reachable from
//! urgency 5 may enable jitter. Nothing else matching resolves to `Standard`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::constants::{
    CRITICAL_ATTEMPT_TIMEOUT, CRITICAL_INITIAL_DELAY, CRITICAL_MAX_ATTEMPTS, CRITICAL_MAX_DELAY,
    EMERGENCY_ATTEMPT_TIMEOUT, EMERGENCY_INITIAL_DELAY, EMERGENCY_MAX_ATTEMPTS,
    EMERGENCY_MAX_DELAY, ROUTINE_ATTEMPT_TIMEOUT, ROUTINE_INITIAL_DELAY, ROUTINE_MAX_ATTEMPTS,
    ROUTINE_MAX_DELAY,
};
use crate::error::{ConfigError, ConfigResult};

/// Caller urgency in `1..=5`, 5 being an emergency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Urgency(u8);

impl Urgency {
    pub const MIN: Urgency = Urgency(1);
    pub const MAX: Urgency = Urgency(5);
    pub const EMERGENCY: Urgency = Urgency(5);

    pub fn new(level: u8) -> ConfigResult<Self> {
        if (Self::MIN.0..=Self::MAX.0).contains(&level) {
            Ok(Self(level))
        } else {
            Err(ConfigError::invalid("urgency", format!("must be between 1 and 5, got {level}")))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Default tier for this urgency
    pub fn policy(self) -> PolicyName {
        match self.0 {
            5 => PolicyName::Aggressive,
            3 | 4 => PolicyName::Standard,
            _ => PolicyName::Conservative,
        }
    }

    /// All valid urgency levels, lowest first
    pub fn all() -> impl Iterator<Item = Urgency> {
        (Self::MIN.0..=Self::MAX.0).map(Urgency)
    }
}

impl TryFrom<u8> for Urgency {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Urgency> for u8 {
    fn from(value: Urgency) -> Self {
        value.0
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    /// Emergency tier: many fast retries, no jitter
    Aggressive,
    /// Critical tier and the fallback
    Standard,
    /// Routine tier: few slow retries
    Conservative,
}

impl PolicyName {
    pub const ALL: [PolicyName; 3] =
        [PolicyName::Aggressive, PolicyName::Standard, PolicyName::Conservative];

    /// Built-in configuration of this tier
    pub fn default_config(self) -> RetryConfig {
        match self {
            PolicyName::Aggressive => RetryConfig::tier(
                EMERGENCY_MAX_ATTEMPTS,
                EMERGENCY_INITIAL_DELAY,
                EMERGENCY_MAX_DELAY,
                false,
                EMERGENCY_ATTEMPT_TIMEOUT,
            ),
            PolicyName::Standard => RetryConfig::tier(
                CRITICAL_MAX_ATTEMPTS,
                CRITICAL_INITIAL_DELAY,
                CRITICAL_MAX_DELAY,
                true,
                CRITICAL_ATTEMPT_TIMEOUT,
            ),
            PolicyName::Conservative => RetryConfig::tier(
                ROUTINE_MAX_ATTEMPTS,
                ROUTINE_INITIAL_DELAY,
                ROUTINE_MAX_DELAY,
                true,
                ROUTINE_ATTEMPT_TIMEOUT,
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyName::Aggressive => "aggressive",
            PolicyName::Standard => "standard",
            PolicyName::Conservative => "conservative",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(PolicyName::Aggressive),
            "standard" => Ok(PolicyName::Standard),
            "conservative" => Ok(PolicyName::Conservative),
            other => Err(ConfigError::invalid("policy", format!("unknown policy '{other}'"))),
        }
    }
}

/// How the caller picks a retry configuration
#[derive(Debug, Clone, PartialEq)]
pub enum PolicySelector {
    /// Operation override if registered, otherwise `Standard`
    Default,
    /// Tiered lookup by urgency
    Urgency(Urgency),
    /// A named tier, bypassing operation overrides
    Named(PolicyName),
    /// An explicit configuration from the call site
    Config(Arc<RetryConfig>),
}

impl PolicySelector {
    /// Urgency carried by this selector, if any
    pub fn urgency(&self) -> Option<Urgency> {
        match self {
            PolicySelector::Urgency(urgency) => Some(*urgency),
            _ => None,
        }
    }
}

impl From<Urgency> for PolicySelector {
    fn from(value: Urgency) -> Self {
        PolicySelector::Urgency(value)
    }
}

impl From<PolicyName> for PolicySelector {
    fn from(value: PolicyName) -> Self {
        PolicySelector::Named(value)
    }
}

impl From<RetryConfig> for PolicySelector {
    fn from(value: RetryConfig) -> Self {
        PolicySelector::Config(Arc::new(value))
    }
}

impl From<Arc<RetryConfig>> for PolicySelector {
    fn from(value: Arc<RetryConfig>) -> Self {
        PolicySelector::Config(value)
    }
}

#[derive(Debug, Default)]
struct OperationPolicies {
    all: Option<Arc<RetryConfig>>,
    by_urgency: HashMap<Urgency, Arc<RetryConfig>>,
}

/// Maps `(operation, urgency)` to a retry configuration
#[derive(Debug)]
pub struct RetryPolicyRegistry {
    named: HashMap<PolicyName, Arc<RetryConfig>>,
    operations: DashMap<String, OperationPolicies>,
}

impl Default for RetryPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyRegistry {
    /// Registry with the built-in tiers and no overrides
    pub fn new() -> Self {
        let named = PolicyName::ALL
            .into_iter()
            .map(|name| (name, Arc::new(name.default_config())))
            .collect();
        Self { named, operations: DashMap::new() }
    }

    /// Replace the configuration of a named tier
    ///
    /// # Errors
    /// Rejects a jittered config for `Aggressive`, the urgency 5 tier.
    pub fn with_named(mut self, name: PolicyName, config: RetryConfig) -> ConfigResult<Self> {
        if name == Urgency::EMERGENCY.policy() {
            ensure_emergency_compatible(&config)?;
        }
        self.named.insert(name, Arc::new(config));
        Ok(self)
    }

    /// Configuration of a named tier
    pub fn named(&self, name: PolicyName) -> Arc<RetryConfig> {
        match self.named.get(&name) {
            Some(config) => Arc::clone(config),
            None => Arc::new(name.default_config()),
        }
    }

    /// Override the configuration for one operation
    ///
    /// Applies to [`PolicySelector::Default`] and urgencies 1-4. Urgency 5
    /// keeps its tier unless overridden through
    /// [`register_operation_urgency`](Self::register_operation_urgency).
    pub fn register_operation(&self, operation_id: impl Into<String>, config: RetryConfig) {
        self.operations.entry(operation_id.into()).or_default().all = Some(Arc::new(config));
    }

    /// Override the configuration for one urgency of one operation
    ///
    /// # Errors
    /// Rejects a jittered config for urgency 5.
    pub fn register_operation_urgency(
        &self,
        operation_id: impl Into<String>,
        urgency: Urgency,
        config: RetryConfig,
    ) -> ConfigResult<()> {
        if urgency == Urgency::EMERGENCY {
            ensure_emergency_compatible(&config)?;
        }
        self.operations
            .entry(operation_id.into())
            .or_default()
            .by_urgency
            .insert(urgency, Arc::new(config));
        Ok(())
    }

    /// Drop every override registered for an operation
    pub fn remove_operation(&self, operation_id: &str) -> bool {
        self.operations.remove(operation_id).is_some()
    }

    /// Tier lookup by urgency
    pub fn for_urgency(&self, operation_id: &str, urgency: Urgency) -> Arc<RetryConfig> {
        if let Some(policies) = self.operations.get(operation_id) {
            if let Some(config) = policies.by_urgency.get(&urgency) {
                return Arc::clone(config);
            }
            if urgency != Urgency::EMERGENCY {
                if let Some(config) = &policies.all {
                    return Arc::clone(config);
                }
            }
        }
        self.named(urgency.policy())
    }

    /// Resolve a selector for an operation
    pub fn resolve(&self, operation_id: &str, selector: &PolicySelector) -> Arc<RetryConfig> {
        match selector {
            PolicySelector::Default => self
                .operations
                .get(operation_id)
                .and_then(|policies| policies.all.clone())
                .unwrap_or_else(|| self.named(PolicyName::Standard)),
            PolicySelector::Urgency(urgency) => self.for_urgency(operation_id, *urgency),
            PolicySelector::Named(name) => self.named(*name),
            PolicySelector::Config(config) => Arc::clone(config),
        }
    }
}

fn ensure_emergency_compatible(config: &RetryConfig) -> ConfigResult<()> {
    if config.jitter_enabled() {
        return Err(ConfigError::invalid("jitter", "must be disabled for urgency 5"));
    }
    Ok(())
}

//! Rate limit policy registry.
//!
//! Policies are a closed set of named `(limit, window)` pairs. The registry
//! is built once at start-up, optionally with overrides from configuration,
//! and every override is validated before the process serves traffic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Time unit for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit in milliseconds.
    pub fn as_millis(&self) -> u64 {
        match self {
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }
}

/// The known policy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyName {
    Login,
    Register,
    VerifyOtp,
    ForgotPassword,
    GenericApi,
    WalletOps,
}

impl PolicyName {
    pub const ALL: [PolicyName; 6] = [
        PolicyName::Login,
        PolicyName::Register,
        PolicyName::VerifyOtp,
        PolicyName::ForgotPassword,
        PolicyName::GenericApi,
        PolicyName::WalletOps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::Login => "login",
            PolicyName::Register => "register",
            PolicyName::VerifyOtp => "verify-otp",
            PolicyName::ForgotPassword => "forgot-password",
            PolicyName::GenericApi => "generic-api",
            PolicyName::WalletOps => "wallet-ops",
        }
    }
}

impl FromStr for PolicyName {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        PolicyName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| TollgateError::PolicyNotFound(s.to_string()))
    }
}

impl std::fmt::Display for PolicyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named rate limit: at most `limit` requests per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    name: PolicyName,
    limit: u64,
    window_ms: u64,
}

impl Policy {
    fn new(name: PolicyName, limit: u64, window_ms: u64) -> Result<Self> {
        if limit == 0 {
            return Err(TollgateError::InvalidPolicy {
                name: name.to_string(),
                reason: "limit must be greater than zero".to_string(),
            });
        }
        if window_ms == 0 {
            return Err(TollgateError::InvalidPolicy {
                name: name.to_string(),
                reason: "window must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            name,
            limit,
            window_ms,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name.as_str()
    }

    pub fn kind(&self) -> PolicyName {
        self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// An override for one policy, as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Number of requests allowed per window
    pub limit: u64,
    /// Window length, in `unit`s
    pub window: u64,
    /// The time unit
    pub unit: TimeUnit,
}

/// The validated table of policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<PolicyName, Policy>,
}

impl PolicyRegistry {
    /// The built-in policy table.
    pub fn builtin() -> Self {
        let table = [
            (PolicyName::Login, 5, 15 * TimeUnit::Minute.as_millis()),
            (PolicyName::Register, 3, TimeUnit::Hour.as_millis()),
            (PolicyName::VerifyOtp, 5, 15 * TimeUnit::Minute.as_millis()),
            (PolicyName::ForgotPassword, 3, TimeUnit::Hour.as_millis()),
            (PolicyName::GenericApi, 100, TimeUnit::Minute.as_millis()),
            (PolicyName::WalletOps, 10, TimeUnit::Minute.as_millis()),
        ];

        let policies = table
            .into_iter()
            .map(|(name, limit, window_ms)| {
                (
                    name,
                    Policy {
                        name,
                        limit,
                        window_ms,
                    },
                )
            })
            .collect();

        Self { policies }
    }

    /// Build the table from the built-ins plus configured overrides.
    ///
    /// Unknown names and zero limits or windows are rejected here, so a bad
    /// configuration stops start-up instead of failing a request later.
    pub fn with_overrides(overrides: &HashMap<String, PolicyOverride>) -> Result<Self> {
        let mut registry = Self::builtin();

        for (raw_name, over) in overrides {
            let name: PolicyName = raw_name.parse()?;
            let window_ms = over.window.saturating_mul(over.unit.as_millis());
            let policy = Policy::new(name, over.limit, window_ms)?;

            info!(
                policy = %name,
                limit = policy.limit,
                window_ms = policy.window_ms,
                "Overriding rate limit policy"
            );
            registry.policies.insert(name, policy);
        }

        Ok(registry)
    }

    /// Parse a YAML map of policy overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: HashMap<String, PolicyOverride> = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy config: {}", e)))?;
        Self::with_overrides(&overrides)
    }

    /// Look up a policy by its configured name.
    pub fn lookup(&self, name: &str) -> Result<Policy> {
        let name: PolicyName = name.parse()?;
        Ok(self.get(name))
    }

    /// Get a policy by its typed name. Every name is always present.
    pub fn get(&self, name: PolicyName) -> Policy {
        self.policies[&name]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

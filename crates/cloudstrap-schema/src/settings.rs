use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Delay applied before a requeued item is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// No delay beyond the queue's settle interval.
    Fixed,
    /// `base_ms * 2^(attempt-1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed => Duration::ZERO,
            Backoff::Exponential { base_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Requeue policy for the deployment backlogs.
///
/// The default retries forever with no backoff growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
}

fn default_backoff() -> Backoff {
    Backoff::Fixed
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Installer settings, read from `<config_dir>/settings.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InstallSettings {
    pub container_name: String,
    pub container_root: String,
    /// Probe attempts during which transient readiness errors are absorbed.
    pub leniency: u32,
    pub poll_interval_ms: u64,
    /// Overall readiness deadline; `None` waits as long as the probe says "not yet".
    pub readiness_timeout_secs: Option<u64>,
    pub settle_interval_ms: u64,
    pub retry: RetryPolicy,
    pub extra_ppa: Option<String>,
    pub extra_packages: Vec<String>,
    /// Command run inside the environment once the cluster manager is bootstrapped.
    pub deploy_command: Option<String>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            container_name: "uoi-bootstrap".to_owned(),
            container_root: "/var/lib/lxc".to_owned(),
            leniency: 20,
            poll_interval_ms: 1000,
            readiness_timeout_secs: None,
            settle_interval_ms: 1000,
            retry: RetryPolicy::default(),
            extra_ppa: None,
            extra_packages: vec!["juju-local".to_owned()],
            deploy_command: Some("cloudstrap deploy".to_owned()),
        }
    }
}

impl InstallSettings {
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, SchemaError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SchemaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.container_name.trim().is_empty() {
            return Err(SchemaError::InvalidSettings(
                "container_name must not be empty".to_owned(),
            ));
        }
        if self.container_name.contains('/') {
            return Err(SchemaError::InvalidSettings(format!(
                "container_name must not contain '/': '{}'",
                self.container_name
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(SchemaError::InvalidSettings(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_secs.map(Duration::from_secs)
    }
}

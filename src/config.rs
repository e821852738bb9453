//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::rule::Rule;
use crate::{AppError, Result};

/// Endpoint harness process settings.
///
/// The harness is the external automation layer that actually drives the
/// chat applications; the relay spawns it as a child process and talks to
/// it over stdio (see [`crate::driver::harness`]).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HarnessConfig {
    /// Harness binary to spawn.
    pub command: String,
    /// Arguments passed to the harness binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Maximum wait for the harness's ready line after spawn.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Per-request timeout for driver calls into the harness.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_startup_timeout_seconds() -> u64 {
    10
}

fn default_request_timeout_seconds() -> u64 {
    30
}

impl HarnessConfig {
    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Visual-stability completion detection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DetectionConfig {
    /// Delay before the baseline capture, letting the destination begin
    /// rendering its reply.
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: u64,
    /// Interval between successive captures.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Consecutive unchanged intervals required to declare stability.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,
    /// Overall deadline for a reply to stabilize.
    #[serde(default = "default_detection_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_initial_delay_seconds() -> u64 {
    2
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_stability_threshold() -> u32 {
    1
}

fn default_detection_timeout_seconds() -> u64 {
    300
}

impl DetectionConfig {
    /// Initial delay as a [`Duration`].
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Detection timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Durable queue sizing and worker polling settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Completed/failed tasks retained per rule.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Combined pending + history size the queue is trimmed to.
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    /// Worker idle wait between empty dequeue attempts.
    #[serde(default = "default_idle_poll_seconds")]
    pub idle_poll_seconds: u64,
}

fn default_history_cap() -> usize {
    100
}

fn default_max_total() -> usize {
    600
}

fn default_idle_poll_seconds() -> u64 {
    2
}

impl QueueConfig {
    /// Idle poll interval as a [`Duration`].
    #[must_use]
    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_seconds)
    }
}

/// Self-loop guard settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GuardConfig {
    /// How many recently relayed replies are remembered.
    #[serde(default = "default_recent_replies")]
    pub recent_replies: usize,
    /// Jaccard character-set similarity above which an inbound message is
    /// treated as a re-ingested relay reply.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

fn default_recent_replies() -> usize {
    5
}

fn default_similarity_threshold() -> f64 {
    0.8
}

/// Global configuration parsed from `courier.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CourierConfig {
    /// Directory holding the queue file and history files.
    pub data_dir: PathBuf,
    /// Operator display name used as the mention target and as the
    /// self-authorship marker.
    #[serde(default)]
    pub operator_name: String,
    /// Endpoint harness process settings.
    pub harness: HarnessConfig,
    /// Completion detection settings.
    #[serde(default = "DetectionConfig::default_values")]
    pub detection: DetectionConfig,
    /// Queue sizing settings.
    #[serde(default = "QueueConfig::default_values")]
    pub queue: QueueConfig,
    /// Self-loop guard settings.
    #[serde(default = "GuardConfig::default_values")]
    pub guard: GuardConfig,
    /// Initial forwarding rule set.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl DetectionConfig {
    fn default_values() -> Self {
        Self {
            initial_delay_seconds: default_initial_delay_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            stability_threshold: default_stability_threshold(),
            timeout_seconds: default_detection_timeout_seconds(),
        }
    }
}

impl QueueConfig {
    fn default_values() -> Self {
        Self {
            history_cap: default_history_cap(),
            max_total: default_max_total(),
            idle_poll_seconds: default_idle_poll_seconds(),
        }
    }
}

impl GuardConfig {
    fn default_values() -> Self {
        Self {
            recent_replies: default_recent_replies(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

impl CourierConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.harness.command.is_empty() {
            return Err(AppError::Config("harness.command must not be empty".into()));
        }
        if self.detection.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "detection.poll_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.detection.stability_threshold == 0 {
            return Err(AppError::Config(
                "detection.stability_threshold must be at least one".into(),
            ));
        }
        if self.detection.timeout_seconds == 0 {
            return Err(AppError::Config(
                "detection.timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.queue.history_cap == 0 {
            return Err(AppError::Config(
                "queue.history_cap must be greater than zero".into(),
            ));
        }
        if self.queue.max_total == 0 {
            return Err(AppError::Config(
                "queue.max_total must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.guard.similarity_threshold) {
            return Err(AppError::Config(
                "guard.similarity_threshold must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

//! Session configuration.
//!
//! Everything the orchestrator needs is supplied up front in one
//! `SessionConfig`, either built in code or loaded from JSON.

use crate::aggregation::{AdaptiveFilterConfig, AggregatorKind};
use crate::core::{Error, Result, WorkerId};
use crate::monitoring::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// How the aggregate is applied to the global model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum UpdateMode {
    /// Workers return full models; the aggregate replaces the global model
    ModelAveraging,
    /// Workers return gradients; `global -= learning_rate * aggregate`
    GradientAveraging { learning_rate: f32 },
}

impl Default for UpdateMode {
    fn default() -> Self {
        Self::ModelAveraging
    }
}

/// Training session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Worker roster
    pub workers: Vec<WorkerId>,
    /// Minimum valid updates per round (defaults to the roster size)
    pub quorum: Option<usize>,
    /// Round budget
    pub max_rounds: u64,
    /// Stop when the round-over-round change is at most this much
    pub convergence_tolerance: Option<f64>,
    /// Collection deadline per round, in milliseconds
    pub round_timeout_ms: u64,
    /// Retries of a failed round before the session terminates
    pub max_round_retries: u32,
    /// Aggregation strategy
    pub aggregator: AggregatorKind,
    /// Adaptive filter parameters
    pub adaptive_filter: AdaptiveFilterConfig,
    /// Update application mode
    pub update_mode: UpdateMode,
    /// Logging setup for embedding applications
    pub logging: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            quorum: None,
            max_rounds: 10,
            convergence_tolerance: None,
            round_timeout_ms: 60_000,
            max_round_retries: 1,
            aggregator: AggregatorKind::Mean,
            adaptive_filter: AdaptiveFilterConfig::default(),
            update_mode: UpdateMode::ModelAveraging,
            logging: LogConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Config with `count` workers named `worker-0`, `worker-1`, ...
    pub fn with_workers(count: usize) -> Self {
        Self {
            workers: (0..count).map(|i| format!("worker-{}", i)).collect(),
            ..Default::default()
        }
    }

    /// Set the roster explicitly.
    pub fn with_roster(mut self, workers: Vec<WorkerId>) -> Self {
        self.workers = workers;
        self
    }

    /// Set quorum.
    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    /// Set round budget.
    pub fn with_max_rounds(mut self, rounds: u64) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Set aggregation strategy.
    pub fn with_aggregator(mut self, kind: AggregatorKind) -> Self {
        self.aggregator = kind;
        self
    }

    /// Set adaptive filter parameters.
    pub fn with_adaptive_filter(mut self, config: AdaptiveFilterConfig) -> Self {
        self.adaptive_filter = config;
        self
    }

    /// Set collection deadline.
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set retry limit.
    pub fn with_max_round_retries(mut self, retries: u32) -> Self {
        self.max_round_retries = retries;
        self
    }

    /// Set convergence tolerance.
    pub fn with_convergence_tolerance(mut self, tolerance: f64) -> Self {
        self.convergence_tolerance = Some(tolerance);
        self
    }

    /// Set update mode.
    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    /// Quorum in effect.
    pub fn effective_quorum(&self) -> usize {
        self.quorum.unwrap_or(self.workers.len())
    }

    /// Collection deadline.
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(Error::InvalidConfig("worker roster is empty".to_string()));
        }
        let unique: BTreeSet<&WorkerId> = self.workers.iter().collect();
        if unique.len() != self.workers.len() {
            return Err(Error::InvalidConfig("worker roster has duplicates".to_string()));
        }

        let quorum = self.effective_quorum();
        if quorum == 0 || quorum > self.workers.len() {
            return Err(Error::InvalidConfig(format!(
                "quorum {} must be between 1 and {}",
                quorum,
                self.workers.len()
            )));
        }
        if self.max_rounds == 0 {
            return Err(Error::InvalidConfig("max_rounds must be at least 1".to_string()));
        }
        if self.round_timeout_ms == 0 {
            return Err(Error::InvalidConfig("round timeout must be positive".to_string()));
        }
        if let Some(tolerance) = self.convergence_tolerance {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "convergence tolerance {} must be finite and non-negative",
                    tolerance
                )));
            }
        }
        if let UpdateMode::GradientAveraging { learning_rate } = self.update_mode {
            if !learning_rate.is_finite() || learning_rate <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "learning rate {} must be positive",
                    learning_rate
                )));
            }
        }
        self.adaptive_filter.validate()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

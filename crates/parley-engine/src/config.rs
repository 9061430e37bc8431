//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_types::{FlowError, Result};

/// What happens to an in-flight conversation when its flow gets a new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Start over on the new version at the next event.
    #[default]
    Restart,
    /// Keep executing the version the conversation started with while the
    /// flow source can still supply it.
    Pin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Non-trigger steps allowed in one turn.
    pub max_steps_per_turn: usize,
    /// Upper bound for one handler invocation, unless the node sets `timeoutMs`.
    #[serde(with = "crate::duration_serde")]
    pub adapter_timeout: Duration,
    #[serde(with = "crate::duration_serde")]
    pub lock_ttl: Duration,
    /// How long an event queues behind a running turn before `LockBusy`.
    #[serde(with = "crate::duration_serde")]
    pub lock_wait: Duration,
    /// Event ids remembered per conversation for duplicate detection.
    pub dedup_window: usize,
    pub version_policy: VersionPolicy,
    /// Save a `running` checkpoint after every completed step.
    pub persist_every_step: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_turn: 50,
            adapter_timeout: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            dedup_window: 32,
            version_policy: VersionPolicy::Restart,
            persist_every_step: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps_per_turn = max_steps;
        self
    }

    fn check(&self) -> Result<()> {
        if self.max_steps_per_turn == 0 {
            return Err(FlowError::Configuration(
                "maxStepsPerTurn must be at least 1".into(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(FlowError::Configuration("lockTtl must be positive".into()));
        }
        if self.lock_ttl <= self.adapter_timeout {
            return Err(FlowError::Configuration(format!(
                "lockTtl ({}ms) must be longer than adapterTimeout ({}ms)",
                self.lock_ttl.as_millis(),
                self.adapter_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

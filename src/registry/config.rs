use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and capacity knobs for the document registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Quiet period after the last edit before a workspace is persisted.
    pub idle_flush: Duration,
    /// How long an entry stays loaded after its last session detaches.
    pub eviction_grace: Duration,
    /// How long an attach waits for an in-flight load.
    pub load_timeout: Duration,
    /// Extra save attempts after the first one fails.
    pub persist_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub retry_backoff: Duration,
    /// Deltas buffered per workspace before a slow session must resync.
    pub fanout_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_flush: Duration::from_secs(2),
            eviction_grace: Duration::from_secs(30),
            load_timeout: Duration::from_secs(10),
            persist_retries: 4,
            retry_backoff: Duration::from_millis(100),
            fanout_capacity: 256,
        }
    }
}

impl RegistryConfig {
    /// Parse from JSON; fields left out keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

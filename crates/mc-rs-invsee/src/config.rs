//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// How store loads and saves are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Inline on the tick. Simple, but a slow store stalls the tick.
    #[default]
    Blocking,
    /// On tokio's blocking pool, bounded by `store_timeout_ms`; results are
    /// picked up on a later tick.
    Background,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub persistence: PersistenceMode,
    /// Upper bound on a background load or save.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Ticks to wait before retrying a failed save-on-release.
    #[serde(default = "default_save_retry_ticks")]
    pub save_retry_ticks: u64,
    /// Keep views open across a target's disconnect, switching them to an
    /// offline copy. When false the views are closed instead.
    #[serde(default = "default_true")]
    pub offline_access: bool,
    #[serde(default = "default_search_results_max")]
    pub search_results_max: usize,
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_save_retry_ticks() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_search_results_max() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            save_retry_ticks: default_save_retry_ticks(),
            offline_access: true,
            search_results_max: default_search_results_max(),
        }
    }
}

impl EngineConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

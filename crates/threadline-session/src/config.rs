use serde::{Deserialize, Serialize};
use std::time::Duration;
use threadline_reconcile::config::duration_ms;
use threadline_reconcile::ReconcileConfig;

/// Background refresh attempt budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshBudget {
    /// Default number of follow-up fetches after an open.
    pub base: u32,
    /// Snapshot shows a running turn and local already streamed.
    pub streaming: u32,
    /// Local shows more tool calls or replies than the snapshot.
    pub richer: u32,
}

impl Default for RefreshBudget {
    fn default() -> Self {
        Self {
            base: 1,
            streaming: 2,
            richer: 3,
        }
    }
}

/// Session host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "refresh_interval_ms", with = "duration_ms")]
    pub refresh_interval: Duration,
    pub refresh: RefreshBudget,
    /// Consecutive refreshes without item growth before the loop stops.
    pub stall_limit: u32,
    pub reconcile: ReconcileConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(2),
            refresh: RefreshBudget::default(),
            stall_limit: 2,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn with_refresh_budget(mut self, budget: RefreshBudget) -> Self {
        self.refresh = budget;
        self
    }

    #[must_use]
    pub fn with_stall_limit(mut self, limit: u32) -> Self {
        self.stall_limit = limit;
        self
    }

    #[must_use]
    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }
}

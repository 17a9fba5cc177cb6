use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable reconciliation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How long a live turn counts as "recently active" without fresh events.
    #[serde(rename = "recency_window_ms", with = "duration_ms")]
    pub recency_window: Duration,
    /// Maximum length difference between the local transcript and the first
    /// snapshot for which a positional bootstrap mapping is attempted.
    pub bootstrap_length_slack: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            recency_window: Duration::from_secs(15),
            bootstrap_length_slack: 2,
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }

    #[must_use]
    pub fn with_bootstrap_length_slack(mut self, slack: usize) -> Self {
        self.bootstrap_length_slack = slack;
        self
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_config_with_millisecond_fields() {
        let cfg: ReconcileConfig = serde_json::from_str(r#"{"recency_window_ms": 5000}"#).unwrap();
        assert_eq!(cfg.recency_window, Duration::from_secs(5));
        assert_eq!(cfg.bootstrap_length_slack, 2);
    }
}

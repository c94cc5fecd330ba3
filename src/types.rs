// =============================================================================
// Shared types used across the Pulse screener
// =============================================================================

use serde::{Deserialize, Serialize};

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Lifecycle state of one exchange worker, queryable via the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    NotStarted,
    Running,
    Stopped,
    Failed,
}

impl Default for ExchangeStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl std::fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Health of an adapter's event flow, derived from `last_event_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterHealth {
    Healthy,
    /// No events for more than 30 s.
    Degraded,
    /// No events for more than 60 s — reconnect is forced.
    Dead,
}

impl AdapterHealth {
    /// Classify from the age of the most recent event.
    pub fn from_idle_ms(idle_ms: i64) -> Self {
        if idle_ms > 60_000 {
            Self::Dead
        } else if idle_ms > 30_000 {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_thresholds() {
        assert_eq!(AdapterHealth::from_idle_ms(0), AdapterHealth::Healthy);
        assert_eq!(AdapterHealth::from_idle_ms(30_000), AdapterHealth::Healthy);
        assert_eq!(AdapterHealth::from_idle_ms(30_001), AdapterHealth::Degraded);
        assert_eq!(AdapterHealth::from_idle_ms(60_001), AdapterHealth::Dead);
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&ExchangeStatus::NotStarted).unwrap();
        assert_eq!(s, "\"not_started\"");
    }
}

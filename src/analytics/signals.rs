// =============================================================================
// Signal detector overlay — entry/exit lifecycle on top of deviation sweeps
// =============================================================================
//
// Disabled by default. Per symbol: an entry fires when the deviation clears
// the entry threshold, no signal is already active, and the cooldown since
// the previous entry has passed. The active signal exits when the deviation
// collapses to the exit threshold, or silently expires.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::analytics::deviation::DeviationRecord;
use crate::runtime_config::SignalsSection;

/// Payload shared by entry and exit messages.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub deviation_pct: Decimal,
    pub cheap_exchange: String,
    pub expensive_exchange: String,
    pub timestamp_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum SignalEvent {
    Entry(SignalRecord),
    Exit(SignalRecord),
}

#[derive(Debug, Default)]
struct SymbolSignalState {
    /// Expiry deadline of the currently active signal, if any.
    active_until_ms: Option<i64>,
    last_entry_ms: Option<i64>,
}

pub struct SignalDetector {
    config: SignalsSection,
    states: HashMap<String, SymbolSignalState>,
}

impl SignalDetector {
    pub fn new(config: SignalsSection) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Feed one deviation observation; returns at most one signal event.
    pub fn observe(&mut self, record: &DeviationRecord, now: i64) -> Option<SignalEvent> {
        let state = self.states.entry(record.symbol.clone()).or_default();
        let dev = record.dev_pct.abs();

        if let Some(expires_at) = state.active_until_ms {
            if now >= expires_at {
                // Expired without converging; clear and fall through so a
                // fresh entry may fire on this same observation.
                state.active_until_ms = None;
            } else if dev <= self.config.exit_threshold_pct {
                state.active_until_ms = None;
                return Some(SignalEvent::Exit(SignalRecord {
                    symbol: record.symbol.clone(),
                    deviation_pct: record.dev_pct,
                    cheap_exchange: record.exchange_cheap.clone(),
                    expensive_exchange: record.exchange_expensive.clone(),
                    timestamp_ms: now,
                    expires_at_ms: expires_at,
                }));
            } else {
                return None;
            }
        }

        if dev < self.config.entry_threshold_pct {
            return None;
        }
        if let Some(last_entry) = state.last_entry_ms {
            if now - last_entry < self.config.cooldown_ms {
                return None;
            }
        }

        let expires_at = now + self.config.expiry_ms;
        state.active_until_ms = Some(expires_at);
        state.last_entry_ms = Some(now);
        Some(SignalEvent::Entry(SignalRecord {
            symbol: record.symbol.clone(),
            deviation_pct: record.dev_pct,
            cheap_exchange: record.exchange_cheap.clone(),
            expensive_exchange: record.exchange_expensive.clone(),
            timestamp_ms: now,
            expires_at_ms: expires_at,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(dev_pct: Decimal) -> DeviationRecord {
        DeviationRecord {
            symbol: "BTC_USDT".into(),
            exchange_cheap: "binance".into(),
            exchange_expensive: "bybit".into(),
            bid_cheap: dec!(100),
            bid_expensive: dec!(101),
            dev_pct,
            ts_ms: 0,
            staleness_ms: 0,
        }
    }

    fn detector() -> SignalDetector {
        SignalDetector::new(SignalsSection {
            enabled: true,
            entry_threshold_pct: dec!(0.35),
            exit_threshold_pct: dec!(0.05),
            cooldown_ms: 10_000,
            expiry_ms: 300_000,
        })
    }

    #[test]
    fn entry_then_exit_lifecycle() {
        let mut d = detector();

        let entry = d.observe(&record(dec!(0.40)), 1_000);
        assert!(matches!(entry, Some(SignalEvent::Entry(_))));

        // Still wide — no event while active.
        assert!(d.observe(&record(dec!(0.20)), 2_000).is_none());

        let exit = d.observe(&record(dec!(0.04)), 3_000);
        match exit {
            Some(SignalEvent::Exit(r)) => assert_eq!(r.symbol, "BTC_USDT"),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_blocks_rapid_reentry() {
        let mut d = detector();
        assert!(d.observe(&record(dec!(0.40)), 1_000).is_some());
        assert!(d.observe(&record(dec!(0.04)), 2_000).is_some()); // exit
        // Re-entry 3 s after the previous entry: still inside the cooldown.
        assert!(d.observe(&record(dec!(0.50)), 4_000).is_none());
        // Past the cooldown it fires again.
        assert!(d.observe(&record(dec!(0.50)), 12_000).is_some());
    }

    #[test]
    fn below_entry_threshold_never_fires() {
        let mut d = detector();
        assert!(d.observe(&record(dec!(0.34)), 1_000).is_none());
    }

    #[test]
    fn active_signal_expires_silently_and_allows_new_entry() {
        let mut d = detector();
        assert!(d.observe(&record(dec!(0.40)), 1_000).is_some());
        // Well past expiry: the stale signal is cleared and a new entry
        // fires in its place.
        let event = d.observe(&record(dec!(0.40)), 1_000 + 300_001);
        assert!(matches!(event, Some(SignalEvent::Entry(_))));
    }
}

// =============================================================================
// Metrics engine — windowed activity scores and symbol ranking
// =============================================================================
//
// Stateless: every tick derives all values fresh from the rolling-window
// store. Pass 1 computes cheap windowed counts for every symbol; only the
// top `detail_top_k` by 3-minute trade count get the expensive enrichment
// (imbalance, pattern detection, composite score), keeping per-tick cost
// proportional to K rather than the full symbol count.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::market_data::{now_ms, SymbolKey, SymbolState, WindowStore};
use crate::types::Side;

const MINUTE_MS: i64 = 60_000;

/// A trade-count acceleration above this is reported as exactly this.
const ACCELERATION_CAP: f64 = 5.0;

/// Minimum trades sharing an exact `(qty, side)` within the last minute to
/// flag a volume pattern.
const PATTERN_MIN_REPEATS: usize = 10;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One ranked symbol. Detail fields are present only for the top
/// `detail_top_k` entries of a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    pub symbol: String,
    /// Pump score: `trades_1m × log10(usd_volume_1m + 1)`.
    pub score: f64,
    pub trades_per_min: u64,
    pub trades_2m: u64,
    pub trades_3m: u64,
    pub trades_5m: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_pattern: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imbalance: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_score: Option<f64>,
    pub last_price: Decimal,
    pub last_update_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change_pct_24h: Option<Decimal>,
}

/// Full ranked output of one metrics tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RankedSnapshot {
    pub timestamp_ms: i64,
    pub entries: Vec<RankedEntry>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MetricsEngine {
    store: Arc<WindowStore>,
    detail_top_k: usize,
}

/// Cheap per-symbol accumulators from pass 1.
struct BasicAccum {
    key: SymbolKey,
    trades_1m: u64,
    trades_2m: u64,
    trades_3m: u64,
    trades_5m: u64,
    usd_volume_1m: Decimal,
    last_price: Decimal,
    last_update_ms: i64,
    ticker_volume_24h: Option<Decimal>,
    ticker_change_pct: Option<Decimal>,
}

impl MetricsEngine {
    pub fn new(store: Arc<WindowStore>, detail_top_k: usize) -> Self {
        Self {
            store,
            detail_top_k,
        }
    }

    /// Compute one ranked snapshot at `now`.
    pub fn compute_snapshot(&self, now: i64) -> RankedSnapshot {
        let mut accums: Vec<BasicAccum> = Vec::with_capacity(self.store.len());

        self.store.for_each_symbol(|key, state| {
            accums.push(basic_pass(key, state, now));
        });

        // Primary key trades_3m desc; ties broken by recency then name so the
        // ordering is deterministic.
        accums.sort_by(|a, b| {
            b.trades_3m
                .cmp(&a.trades_3m)
                .then(b.last_update_ms.cmp(&a.last_update_ms))
                .then(a.key.to_string().cmp(&b.key.to_string()))
        });

        let mut entries = Vec::with_capacity(accums.len());
        for (rank, accum) in accums.into_iter().enumerate() {
            let entry = if rank < self.detail_top_k {
                self.enrich(accum, now)
            } else {
                basic_entry(accum)
            };
            entries.push(entry);
        }

        RankedSnapshot {
            timestamp_ms: now,
            entries,
        }
    }

    /// Detail pass for one top-K symbol: a second short critical section over
    /// its last minute of trades.
    fn enrich(&self, accum: BasicAccum, now: i64) -> RankedEntry {
        let cutoff_1m = now - MINUTE_MS;
        let detail = self
            .store
            .with_symbol(&accum.key, |state| {
                let mut buy_usd = Decimal::ZERO;
                let mut sell_usd = Decimal::ZERO;
                let mut groups: HashMap<(Decimal, Side), usize> = HashMap::new();
                for trade in state.trades.iter().filter(|t| t.ts_ms >= cutoff_1m) {
                    match trade.side {
                        Side::Buy => buy_usd += trade.usd_value(),
                        Side::Sell => sell_usd += trade.usd_value(),
                    }
                    *groups
                        .entry((trade.qty.normalize(), trade.side))
                        .or_insert(0) += 1;
                }
                let has_pattern = groups.values().any(|&n| n >= PATTERN_MIN_REPEATS);
                (buy_usd, sell_usd, has_pattern)
            })
            .unwrap_or((Decimal::ZERO, Decimal::ZERO, false));

        let (buy_usd, sell_usd, has_pattern) = detail;
        let imbalance = imbalance(buy_usd, sell_usd);
        let acceleration = acceleration(accum.trades_1m, accum.trades_2m);
        let pump = pump_score(accum.trades_1m, accum.usd_volume_1m);
        let composite = composite_score(pump, acceleration, has_pattern, imbalance);

        let volume_24h = accum.ticker_volume_24h;
        let price_change_pct_24h = accum.ticker_change_pct;
        let mut entry = basic_entry(accum);
        entry.acceleration = Some(acceleration);
        entry.has_pattern = Some(has_pattern);
        entry.imbalance = Some(imbalance);
        entry.composite_score = Some(composite);
        entry.volume_24h = volume_24h;
        entry.price_change_pct_24h = price_change_pct_24h;
        entry
    }
}

fn basic_pass(key: &SymbolKey, state: &SymbolState, now: i64) -> BasicAccum {
    let mut accum = BasicAccum {
        key: key.clone(),
        trades_1m: 0,
        trades_2m: 0,
        trades_3m: 0,
        trades_5m: 0,
        usd_volume_1m: Decimal::ZERO,
        last_price: state.last_price,
        last_update_ms: state.last_update_ms,
        ticker_volume_24h: state.ticker.as_ref().map(|t| t.quote_volume_24h),
        ticker_change_pct: state.ticker.as_ref().map(|t| t.price_change_pct_24h),
    };

    for trade in &state.trades {
        let age = now - trade.ts_ms;
        if age <= 5 * MINUTE_MS {
            accum.trades_5m += 1;
            if age <= 3 * MINUTE_MS {
                accum.trades_3m += 1;
                if age <= 2 * MINUTE_MS {
                    accum.trades_2m += 1;
                    if age <= MINUTE_MS {
                        accum.trades_1m += 1;
                        accum.usd_volume_1m += trade.usd_value();
                    }
                }
            }
        }
    }
    accum
}

fn basic_entry(accum: BasicAccum) -> RankedEntry {
    RankedEntry {
        symbol: accum.key.to_string(),
        score: pump_score(accum.trades_1m, accum.usd_volume_1m),
        trades_per_min: accum.trades_1m,
        trades_2m: accum.trades_2m,
        trades_3m: accum.trades_3m,
        trades_5m: accum.trades_5m,
        acceleration: None,
        has_pattern: None,
        imbalance: None,
        composite_score: None,
        last_price: accum.last_price,
        last_update_ms: accum.last_update_ms,
        // The 24 h ticker merge is part of the top-K enrichment.
        volume_24h: None,
        price_change_pct_24h: None,
    }
}

// ---------------------------------------------------------------------------
// Formulas
// ---------------------------------------------------------------------------

/// `trades_1m × log10(usd_volume_1m + 1)`, falling back to the bare count
/// when the window carried no volume.
pub fn pump_score(trades_1m: u64, usd_volume_1m: Decimal) -> f64 {
    if usd_volume_1m <= Decimal::ZERO {
        return trades_1m as f64;
    }
    let volume = usd_volume_1m.to_f64().unwrap_or(0.0);
    trades_1m as f64 * (volume + 1.0).log10()
}

/// Current-minute count over previous-minute count, `1.0` when the previous
/// minute had no more trades than the current one, capped at 5.
pub fn acceleration(trades_1m: u64, trades_2m: u64) -> f64 {
    let previous = trades_2m as i64 - trades_1m as i64;
    if previous <= 0 {
        return 1.0;
    }
    (trades_1m as f64 / previous as f64).min(ACCELERATION_CAP)
}

/// `|buy − sell| / (buy + sell)` in USD terms, `0` on an empty window.
pub fn imbalance(buy_usd: Decimal, sell_usd: Decimal) -> Decimal {
    let total = buy_usd + sell_usd;
    if total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (buy_usd - sell_usd).abs() / total
}

/// Weighted blend of pump score, acceleration, pattern flag and imbalance.
pub fn composite_score(
    pump: f64,
    acceleration: f64,
    has_pattern: bool,
    imbalance: Decimal,
) -> f64 {
    let pattern_bonus = if has_pattern { 100.0 } else { 0.0 };
    let imbalance_bonus = imbalance.to_f64().unwrap_or(0.0) * 100.0;
    pump * (1.0 + acceleration.min(ACCELERATION_CAP) / 2.0) + pattern_bonus + imbalance_bonus
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Periodic ranking loop; publishes each snapshot on a watch channel.
pub async fn run_metrics_worker(
    engine: MetricsEngine,
    snapshot_tx: watch::Sender<RankedSnapshot>,
    interval: std::time::Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let started = std::time::Instant::now();
        let snapshot = engine.compute_snapshot(now_ms());
        let elapsed = started.elapsed();
        if elapsed > interval / 2 {
            warn!(?elapsed, symbols = snapshot.entries.len(), "slow metrics tick");
        } else {
            debug!(?elapsed, symbols = snapshot.entries.len(), "metrics tick");
        }
        if snapshot_tx.send(snapshot).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineCounters;
    use crate::market_data::{TradeTick, WindowConfig};
    use rust_decimal_macros::dec;

    fn test_store() -> Arc<WindowStore> {
        Arc::new(WindowStore::new(
            WindowConfig::default(),
            Arc::new(PipelineCounters::default()),
        ))
    }

    fn feed(store: &WindowStore, symbol: &str, count: usize, ts_ms: i64, qty: Decimal, side: Side) {
        let key = SymbolKey::new("binance", symbol);
        for i in 0..count {
            let ts = ts_ms + i as i64;
            store.apply(
                crate::market_data::MarketEvent::Trade {
                    key: key.clone(),
                    trade: TradeTick {
                        price: dec!(10),
                        qty,
                        side,
                        ts_ms: ts,
                    },
                },
                ts,
            );
        }
    }

    #[test]
    fn ranking_sorts_by_trades_3m_descending() {
        let store = test_store();
        let now = 10 * MINUTE_MS;
        feed(&store, "AAAUSDT", 5, now - 1_000, dec!(1), Side::Buy);
        feed(&store, "BBBUSDT", 50, now - 1_000, dec!(1), Side::Buy);
        feed(&store, "CCCUSDT", 20, now - 1_000, dec!(1), Side::Buy);

        let engine = MetricsEngine::new(store, 500);
        let snapshot = engine.compute_snapshot(now);
        let symbols: Vec<&str> = snapshot
            .entries
            .iter()
            .map(|e| e.symbol.as_str())
            .collect();
        assert_eq!(
            symbols,
            vec!["binance:BBB_USDT", "binance:CCC_USDT", "binance:AAA_USDT"]
        );
    }

    #[test]
    fn only_top_k_gets_detail_fields() {
        let store = test_store();
        let now = 10 * MINUTE_MS;
        feed(&store, "AAAUSDT", 5, now - 1_000, dec!(1), Side::Buy);
        feed(&store, "BBBUSDT", 8, now - 1_000, dec!(1), Side::Buy);

        let engine = MetricsEngine::new(store, 1);
        let snapshot = engine.compute_snapshot(now);
        assert!(snapshot.entries[0].composite_score.is_some());
        assert!(snapshot.entries[1].composite_score.is_none());
        assert!(snapshot.entries[1].imbalance.is_none());
    }

    #[test]
    fn pump_score_falls_back_to_count_without_volume() {
        assert_eq!(pump_score(7, Decimal::ZERO), 7.0);
        // 3 trades, 999 USD: 3 * log10(1000) = 9.
        let score = pump_score(3, dec!(999));
        assert!((score - 9.0).abs() < 1e-9);
    }

    #[test]
    fn acceleration_defaults_and_caps() {
        // Previous minute had zero trades.
        assert_eq!(acceleration(10, 10), 1.0);
        // Previous minute had seven trades against three current.
        assert!((acceleration(3, 10) - 3.0 / 7.0).abs() < 1e-9);
        // 40 current vs 2 previous would be 20 — capped.
        assert_eq!(acceleration(40, 42), 5.0);
    }

    #[test]
    fn imbalance_is_bounded_and_zero_on_empty() {
        assert_eq!(imbalance(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
        assert_eq!(imbalance(dec!(100), Decimal::ZERO), dec!(1));
        assert_eq!(imbalance(dec!(75), dec!(25)), dec!(0.5));
    }

    #[test]
    fn composite_combines_all_terms() {
        let score = composite_score(10.0, 2.0, true, dec!(0.5));
        // 10 * (1 + 1) + 100 + 50
        assert!((score - 170.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_flag_requires_ten_exact_repeats() {
        let store = test_store();
        let now = 10 * MINUTE_MS;
        // Ten buys of exactly 2.5 — pattern.
        feed(&store, "PATUSDT", 10, now - 1_000, dec!(2.5), Side::Buy);
        // Nine buys of 7 — no pattern.
        feed(&store, "NOPUSDT", 9, now - 1_000, dec!(7), Side::Buy);

        let engine = MetricsEngine::new(store, 500);
        let snapshot = engine.compute_snapshot(now);
        let by_symbol: HashMap<&str, &RankedEntry> = snapshot
            .entries
            .iter()
            .map(|e| (e.symbol.as_str(), e))
            .collect();
        assert_eq!(by_symbol["binance:PAT_USDT"].has_pattern, Some(true));
        assert_eq!(by_symbol["binance:NOP_USDT"].has_pattern, Some(false));
    }

    #[test]
    fn pattern_groups_by_normalized_decimal_qty() {
        let store = test_store();
        let now = 10 * MINUTE_MS;
        let key = SymbolKey::new("binance", "MIXUSDT");
        // 2.5 and 2.50 are the same quantity; together they cross the bar.
        for i in 0..5 {
            let ts = now - 1_000 + i;
            store.apply(
                crate::market_data::MarketEvent::Trade {
                    key: key.clone(),
                    trade: TradeTick {
                        price: dec!(10),
                        qty: dec!(2.5),
                        side: Side::Sell,
                        ts_ms: ts,
                    },
                },
                ts,
            );
        }
        for i in 5..10 {
            let ts = now - 1_000 + i;
            store.apply(
                crate::market_data::MarketEvent::Trade {
                    key: key.clone(),
                    trade: TradeTick {
                        price: dec!(10),
                        qty: dec!(2.50),
                        side: Side::Sell,
                        ts_ms: ts,
                    },
                },
                ts,
            );
        }

        let engine = MetricsEngine::new(store, 500);
        let snapshot = engine.compute_snapshot(now);
        assert_eq!(snapshot.entries[0].has_pattern, Some(true));
    }

    #[test]
    fn window_counts_are_cumulative() {
        let store = test_store();
        let now = 10 * MINUTE_MS;
        let key = SymbolKey::new("binance", "WINUSDT");
        // One trade in each of the last five minutes.
        for minute in 0..5 {
            let ts = now - minute * MINUTE_MS - 1_000;
            store.apply(
                crate::market_data::MarketEvent::Trade {
                    key: key.clone(),
                    trade: TradeTick {
                        price: dec!(1),
                        qty: dec!(1),
                        side: Side::Buy,
                        ts_ms: ts,
                    },
                },
                now,
            );
        }

        let engine = MetricsEngine::new(store, 500);
        let entry = &engine.compute_snapshot(now).entries[0];
        assert_eq!(entry.trades_per_min, 1);
        assert_eq!(entry.trades_2m, 2);
        assert_eq!(entry.trades_3m, 3);
        assert_eq!(entry.trades_5m, 5);
    }
}

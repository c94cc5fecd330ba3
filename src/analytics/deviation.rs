// =============================================================================
// Deviation & alignment engine — cross-exchange bid/bid comparison
// =============================================================================
//
// For symbols quoted on two or more venues, the sweep compares the latest
// bids pairwise and emits a record whenever the gap clears the configured
// threshold. Point alignment answers "what did both venues believe at t*"
// with a backward as-of join over the trade buffers — never looking ahead.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::market_data::{now_ms, SymbolKey, WindowStore};

/// One above-threshold pair observation.
#[derive(Debug, Clone, Serialize)]
pub struct DeviationRecord {
    /// Normalized symbol (no exchange component).
    pub symbol: String,
    pub exchange_cheap: String,
    pub exchange_expensive: String,
    pub bid_cheap: Decimal,
    pub bid_expensive: Decimal,
    /// `(bid_expensive − bid_cheap) / bid_cheap × 100`.
    pub dev_pct: Decimal,
    pub ts_ms: i64,
    /// Age of the older of the two sides at emission time. Carried for
    /// downstream staleness policy; the engine itself does not filter on it.
    pub staleness_ms: i64,
}

/// Latest known bid for one `(exchange, symbol)` side.
#[derive(Debug, Clone)]
struct BidPoint {
    exchange: String,
    bid: Decimal,
    ts_ms: i64,
}

pub struct DeviationEngine {
    store: Arc<WindowStore>,
    min_threshold_pct: Decimal,
}

impl DeviationEngine {
    pub fn new(store: Arc<WindowStore>, min_threshold_pct: Decimal) -> Self {
        Self {
            store,
            min_threshold_pct,
        }
    }

    /// Backward as-of join: the most recent trade price on each venue with
    /// `ts <= t_ms`, or `None` when either side has no observation yet.
    pub fn aligned_prices(
        &self,
        symbol: &str,
        ex_i: &str,
        ex_j: &str,
        t_ms: i64,
    ) -> Option<(Decimal, Decimal, i64)> {
        let (price_i, _) = self
            .store
            .last_trade_at_or_before(&SymbolKey::new(ex_i, symbol), t_ms)?;
        let (price_j, _) = self
            .store
            .last_trade_at_or_before(&SymbolKey::new(ex_j, symbol), t_ms)?;
        Some((price_i, price_j, t_ms))
    }

    /// One sweep over every multi-venue symbol. Quote bids are authoritative;
    /// a venue that has traded but never quoted contributes its last trade
    /// price instead. Missing data on either side yields no emission.
    pub fn sweep(&self, now: i64) -> Vec<DeviationRecord> {
        let mut by_symbol: HashMap<String, Vec<BidPoint>> = HashMap::new();

        self.store.for_each_symbol(|key, state| {
            let point = match &state.last_quote {
                Some(quote) if quote.bid > Decimal::ZERO => Some(BidPoint {
                    exchange: key.exchange.clone(),
                    bid: quote.bid,
                    ts_ms: quote.ts_ms,
                }),
                _ if state.last_price > Decimal::ZERO => Some(BidPoint {
                    exchange: key.exchange.clone(),
                    bid: state.last_price,
                    ts_ms: state.last_update_ms,
                }),
                _ => None,
            };
            if let Some(point) = point {
                by_symbol.entry(key.symbol.clone()).or_default().push(point);
            }
        });

        let mut records = Vec::new();
        for (symbol, mut points) in by_symbol {
            if points.len() < 2 {
                continue;
            }
            points.sort_by(|a, b| a.exchange.cmp(&b.exchange));
            for i in 0..points.len() {
                for j in (i + 1)..points.len() {
                    if let Some(record) = pair_deviation(&symbol, &points[i], &points[j], now) {
                        if record.dev_pct.abs() >= self.min_threshold_pct {
                            records.push(record);
                        }
                    }
                }
            }
        }
        records
    }
}

/// Deviation for one unordered exchange pair; `None` when either bid is zero.
fn pair_deviation(
    symbol: &str,
    a: &BidPoint,
    b: &BidPoint,
    now: i64,
) -> Option<DeviationRecord> {
    if a.bid <= Decimal::ZERO || b.bid <= Decimal::ZERO {
        return None;
    }
    let (cheap, expensive) = if a.bid <= b.bid { (a, b) } else { (b, a) };
    let dev_pct = (expensive.bid - cheap.bid) / cheap.bid * dec!(100);
    Some(DeviationRecord {
        symbol: symbol.to_string(),
        exchange_cheap: cheap.exchange.clone(),
        exchange_expensive: expensive.exchange.clone(),
        bid_cheap: cheap.bid,
        bid_expensive: expensive.bid,
        dev_pct,
        ts_ms: now,
        staleness_ms: now - cheap.ts_ms.min(expensive.ts_ms),
    })
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Periodic sweep loop; each batch of records is sent downstream as one unit.
pub async fn run_deviation_worker(
    engine: DeviationEngine,
    records_tx: mpsc::Sender<Vec<DeviationRecord>>,
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
        let records = engine.sweep(now_ms());
        if records.is_empty() {
            continue;
        }
        debug!(count = records.len(), "deviation sweep emitted records");
        if records_tx.send(records).await.is_err() {
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
    use crate::market_data::{MarketEvent, QuoteTick, TradeTick, WindowConfig};
    use crate::types::Side;

    fn test_store() -> Arc<WindowStore> {
        Arc::new(WindowStore::new(
            WindowConfig::default(),
            Arc::new(PipelineCounters::default()),
        ))
    }

    fn trade(store: &WindowStore, exchange: &str, symbol: &str, price: Decimal, ts_ms: i64) {
        store.apply(
            MarketEvent::Trade {
                key: SymbolKey::new(exchange, symbol),
                trade: TradeTick {
                    price,
                    qty: dec!(1),
                    side: Side::Buy,
                    ts_ms,
                },
            },
            ts_ms,
        );
    }

    fn quote(store: &WindowStore, exchange: &str, symbol: &str, bid: Decimal, ts_ms: i64) {
        store.apply(
            MarketEvent::Quote {
                key: SymbolKey::new(exchange, symbol),
                quote: QuoteTick {
                    bid,
                    ask: bid + dec!(0.1),
                    bid_qty: None,
                    ask_qty: None,
                    ts_ms,
                },
            },
            ts_ms,
        );
    }

    #[test]
    fn backward_as_of_join_respects_target_time() {
        let store = test_store();
        trade(&store, "binance", "BTCUSDT", dec!(100), 10_000);
        trade(&store, "bybit", "BTCUSDT", dec!(101), 20_000);

        let engine = DeviationEngine::new(store, dec!(0.10));

        // At t*=15s the second venue has no observation yet.
        assert!(engine
            .aligned_prices("BTC_USDT", "binance", "bybit", 15_000)
            .is_none());

        // At t*=25s both sides resolve to their latest earlier trades.
        let (p_i, p_j, t) = engine
            .aligned_prices("BTC_USDT", "binance", "bybit", 25_000)
            .unwrap();
        assert_eq!(p_i, dec!(100));
        assert_eq!(p_j, dec!(101));
        assert_eq!(t, 25_000);
    }

    #[test]
    fn sweep_emits_above_threshold_with_cheap_side_identified() {
        let store = test_store();
        quote(&store, "binance", "BTCUSDT", dec!(100), 1_000);
        quote(&store, "bybit", "BTCUSDT", dec!(100.5), 1_100);

        let engine = DeviationEngine::new(store, dec!(0.10));
        let records = engine.sweep(2_000);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.symbol, "BTC_USDT");
        assert_eq!(r.exchange_cheap, "binance");
        assert_eq!(r.exchange_expensive, "bybit");
        assert_eq!(r.dev_pct, dec!(0.5));
        assert_eq!(r.staleness_ms, 1_000);
    }

    #[test]
    fn sweep_ignores_below_threshold_pairs() {
        let store = test_store();
        quote(&store, "binance", "BTCUSDT", dec!(100), 1_000);
        quote(&store, "bybit", "BTCUSDT", dec!(100.05), 1_000);

        let engine = DeviationEngine::new(store, dec!(0.10));
        assert!(engine.sweep(2_000).is_empty());
    }

    #[test]
    fn sweep_skips_single_venue_symbols() {
        let store = test_store();
        quote(&store, "binance", "BTCUSDT", dec!(100), 1_000);

        let engine = DeviationEngine::new(store, dec!(0.10));
        assert!(engine.sweep(2_000).is_empty());
    }

    #[test]
    fn trade_price_is_fallback_when_no_quote_exists() {
        let store = test_store();
        quote(&store, "binance", "BTCUSDT", dec!(100), 1_000);
        // Bybit side has trades but no quote yet.
        trade(&store, "bybit", "BTCUSDT", dec!(102), 1_500);

        let engine = DeviationEngine::new(store, dec!(0.10));
        let records = engine.sweep(2_000);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bid_expensive, dec!(102));
        assert_eq!(records[0].exchange_expensive, "bybit");
    }

    #[test]
    fn equal_bids_produce_no_record_at_default_threshold() {
        let store = test_store();
        quote(&store, "binance", "BTCUSDT", dec!(100), 1_000);
        quote(&store, "bybit", "BTCUSDT", dec!(100), 1_000);

        let engine = DeviationEngine::new(store, dec!(0.10));
        assert!(engine.sweep(2_000).is_empty());
    }
}

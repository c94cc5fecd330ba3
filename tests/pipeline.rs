// =============================================================================
// End-to-end pipeline scenarios, run against in-process components
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pulse_screener::analytics::{DeviationEngine, MetricsEngine};
use pulse_screener::broadcast::aggregate_trades;
use pulse_screener::errors::{PipelineCounters, ScreenerError};
use pulse_screener::exchanges::ExchangeAdapter;
use pulse_screener::market_data::{
    now_ms, MarketEvent, SymbolInfo, SymbolKey, TickerStats, TradeTick, WindowConfig, WindowStore,
};
use pulse_screener::orchestrator::Orchestrator;
use pulse_screener::runtime_config::ExchangeConfig;
use pulse_screener::types::{ExchangeStatus, Side};

const MINUTE_MS: i64 = 60_000;

fn test_store() -> Arc<WindowStore> {
    Arc::new(WindowStore::new(
        WindowConfig::default(),
        Arc::new(PipelineCounters::default()),
    ))
}

fn trade_event(exchange: &str, symbol: &str, price: rust_decimal::Decimal, ts_ms: i64) -> MarketEvent {
    MarketEvent::Trade {
        key: SymbolKey::new(exchange, symbol),
        trade: TradeTick {
            price,
            qty: dec!(1),
            side: Side::Buy,
            ts_ms,
        },
    }
}

// ---------------------------------------------------------------------------
// Scenario: single-symbol aggregation
// ---------------------------------------------------------------------------

#[test]
fn single_symbol_aggregation_bucket() {
    let store = test_store();
    for (ts, price) in [(0, dec!(10)), (50, dec!(11)), (100, dec!(9)), (150, dec!(10.5))] {
        store.apply(trade_event("binance", "BTCUSDT", price, ts), ts);
    }

    let drained = store.drain_pending();
    assert_eq!(drained.len(), 1);
    let bucket = aggregate_trades(&drained[0].1).unwrap();

    assert_eq!(bucket.open, dec!(10));
    assert_eq!(bucket.high, dec!(11));
    assert_eq!(bucket.low, dec!(9));
    assert_eq!(bucket.close, dec!(10.5));
    assert_eq!(bucket.volume, dec!(40.5));
    assert_eq!(bucket.trade_count, 4);
    assert_eq!(bucket.buy_volume, dec!(40.5));
    assert_eq!(bucket.sell_volume, dec!(0));
}

// ---------------------------------------------------------------------------
// Scenario: ranking by trades_3m
// ---------------------------------------------------------------------------

#[test]
fn ranking_and_top_n_agree() {
    let store = test_store();
    let now = 60 * MINUTE_MS;
    let counts = [("AAAUSDT", 5), ("BBBUSDT", 50), ("CCCUSDT", 20)];
    for (symbol, count) in counts {
        for i in 0..count {
            let ts = now - 30_000 + i;
            store.apply(trade_event("binance", symbol, dec!(1), ts), ts);
        }
    }

    let engine = MetricsEngine::new(store, 500);
    let snapshot = engine.compute_snapshot(now);
    let order: Vec<&str> = snapshot.entries.iter().map(|e| e.symbol.as_str()).collect();
    assert_eq!(
        order,
        vec!["binance:BBB_USDT", "binance:CCC_USDT", "binance:AAA_USDT"]
    );

    // The top-2 cut of the ranking is exactly its first two entries.
    let top_2: Vec<&str> = order.iter().take(2).copied().collect();
    assert_eq!(top_2, vec!["binance:BBB_USDT", "binance:CCC_USDT"]);
}

// ---------------------------------------------------------------------------
// Scenario: window eviction under load
// ---------------------------------------------------------------------------

#[test]
fn window_and_cap_bounds_hold_under_skewed_history() {
    let store = test_store();
    let key = SymbolKey::new("binance", "XUSDT");
    let window = store.config().window_ms;
    let start = 100 * MINUTE_MS;
    let span = 45 * MINUTE_MS;

    // 6,000 trades spread across 45 minutes of arrivals.
    for i in 0..6_000i64 {
        let ts = start + i * span / 6_000;
        store.apply(trade_event("binance", "XUSDT", dec!(2), ts), ts);
    }

    let end = start + span;
    let trades = store.snapshot_trades(&key).unwrap();
    assert!(trades.len() <= 5_000);
    assert!(trades.iter().all(|t| end - t.ts_ms <= window));
}

// ---------------------------------------------------------------------------
// Scenario: backward as-of join
// ---------------------------------------------------------------------------

#[test]
fn aligned_prices_backward_join() {
    let store = test_store();
    store.apply(trade_event("e1", "SYMUSDT", dec!(100), 10_000), 10_000);
    store.apply(trade_event("e2", "SYMUSDT", dec!(101), 20_000), 20_000);

    let engine = DeviationEngine::new(store, dec!(0.10));

    // At t* = 15 s the E2 side has nothing at or before the target: no output.
    assert!(engine.aligned_prices("SYM_USDT", "e1", "e2", 15_000).is_none());

    let (p1, p2, t) = engine
        .aligned_prices("SYM_USDT", "e1", "e2", 25_000)
        .unwrap();
    assert_eq!((p1, p2, t), (dec!(100), dec!(101), 25_000));
}

// ---------------------------------------------------------------------------
// Scenario: deviation emit
// ---------------------------------------------------------------------------

#[test]
fn deviation_emitted_with_cheap_and_expensive_sides() {
    let store = test_store();
    for (exchange, bid) in [("e1", dec!(100)), ("e2", dec!(100.5))] {
        store.apply(
            MarketEvent::Quote {
                key: SymbolKey::new(exchange, "SYMUSDT"),
                quote: pulse_screener::market_data::QuoteTick {
                    bid,
                    ask: bid + dec!(0.1),
                    bid_qty: None,
                    ask_qty: None,
                    ts_ms: 1_000,
                },
            },
            1_000,
        );
    }

    let engine = DeviationEngine::new(store, dec!(0.10));
    let records = engine.sweep(2_000);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exchange_cheap, "e1");
    assert_eq!(records[0].exchange_expensive, "e2");
    assert_eq!(records[0].dev_pct, dec!(0.5));
}

// ---------------------------------------------------------------------------
// Scenario: adapter dies, siblings survive
// ---------------------------------------------------------------------------

/// Test double: serves one symbol and emits one trade per subscribe call;
/// optionally fails its first subscribe.
struct ScriptedAdapter {
    name: &'static str,
    symbol: &'static str,
    fail_first: AtomicBool,
    subscribe_calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(name: &'static str, symbol: &'static str, fail_first: bool) -> Self {
        Self {
            name,
            symbol,
            fail_first: AtomicBool::new(fail_first),
            subscribe_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, ScreenerError> {
        Ok(vec![SymbolInfo {
            symbol: self.symbol.to_string(),
            price_step: dec!(0.01),
            qty_step: dec!(0.001),
            min_notional: dec!(5),
        }])
    }

    async fn list_tickers_24h(&self) -> Result<Vec<(String, TickerStats)>, ScreenerError> {
        Ok(vec![(
            self.symbol.to_string(),
            TickerStats {
                quote_volume_24h: dec!(1000000),
                price_change_pct_24h: dec!(0),
                last_price: dec!(1),
                best_bid: None,
                best_ask: None,
            },
        )])
    }

    async fn subscribe(
        &self,
        symbols: Vec<String>,
        out: mpsc::Sender<MarketEvent>,
        stop: CancellationToken,
    ) -> Result<(), ScreenerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(ScreenerError::Protocol("scripted connection loss".into()));
        }
        let ts = now_ms();
        for symbol in &symbols {
            let event = MarketEvent::Trade {
                key: SymbolKey {
                    exchange: self.name.to_string(),
                    symbol: symbol.clone(),
                },
                trade: TradeTick {
                    price: dec!(7),
                    qty: dec!(1),
                    side: Side::Buy,
                    ts_ms: ts,
                },
            };
            let _ = out.send(event).await;
        }
        stop.cancelled().await;
        Ok(())
    }

    fn last_event_ms(&self) -> i64 {
        now_ms()
    }
}

#[tokio::test]
async fn failed_adapter_restarts_without_touching_siblings() {
    let counters = Arc::new(PipelineCounters::default());
    let store = Arc::new(WindowStore::new(WindowConfig::default(), counters.clone()));
    let token = CancellationToken::new();

    let alpha = Arc::new(ScriptedAdapter::new("alpha", "ALP_USDT", true));
    let beta = Arc::new(ScriptedAdapter::new("beta", "BET_USDT", false));

    let wide_band = ExchangeConfig {
        min_quote_volume_24h: dec!(1),
        max_quote_volume_24h: dec!(1000000000),
        exclude_symbols: Vec::new(),
        exclude_if_listed_on: None,
    };
    let configs: HashMap<String, ExchangeConfig> = [
        ("alpha".to_string(), wide_band.clone()),
        ("beta".to_string(), wide_band),
    ]
    .into();

    let (event_tx, mut event_rx) = mpsc::channel::<MarketEvent>(1024);
    {
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                store.apply(event, now_ms());
            }
        });
    }

    let adapters: Vec<Arc<dyn ExchangeAdapter>> = vec![alpha.clone(), beta.clone()];
    let orchestrator = Orchestrator::new(
        adapters,
        configs,
        event_tx,
        counters,
        token.clone(),
    )
    .with_restart_delay(Duration::from_millis(20));
    let handles = orchestrator.start();

    // The healthy sibling's trades arrive even while alpha is down.
    wait_until(Duration::from_secs(2), || {
        store
            .snapshot_trades(&SymbolKey::new("beta", "BETUSDT"))
            .is_some_and(|t| !t.is_empty())
    })
    .await;

    // Alpha recovers within the backoff window and its symbols reappear.
    wait_until(Duration::from_secs(2), || {
        store
            .snapshot_trades(&SymbolKey::new("alpha", "ALPUSDT"))
            .is_some_and(|t| !t.is_empty())
    })
    .await;
    assert!(alpha.subscribe_calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(orchestrator.status("alpha"), ExchangeStatus::Running);
    assert_eq!(orchestrator.status("beta"), ExchangeStatus::Running);

    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    assert_eq!(orchestrator.status("alpha"), ExchangeStatus::Stopped);
    assert_eq!(orchestrator.status("beta"), ExchangeStatus::Stopped);
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

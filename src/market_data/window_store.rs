// =============================================================================
// Rolling-window store — the single source of truth for recent activity
// =============================================================================
//
// A sharded map from (exchange, symbol) to per-symbol state. Each symbol owns
// a time-ordered trade buffer bounded two ways: by age (nothing older than the
// window) and by size (at most `trades_per_symbol_cap` entries). Eviction
// happens at exactly one place — the write path. Readers either count in
// place under the shard lock or copy out; nothing retains a reference into a
// buffer after the lock is released.
//
// One writer (the ingestion consumer) mutates the store; the metrics,
// deviation and aggregation workers only read.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::errors::PipelineCounters;
use crate::market_data::events::{MarketEvent, QuoteTick, SymbolKey, TickerStats, TradeTick};

/// Number of independent shards. Symbols spread by `hash(key) % SHARD_COUNT`.
const SHARD_COUNT: usize = 16;

/// Callback invoked when a symbol is evicted to make room for a new one.
pub type SymbolRemovedListener = Box<dyn Fn(&SymbolKey) + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Retention window.
    pub window_ms: i64,
    /// Per-symbol trade buffer cap.
    pub trades_per_symbol_cap: usize,
    /// Total live symbol cap.
    pub symbol_cap: usize,
    /// Trades stamped further than this into the future are rejected.
    pub clock_skew_tolerance_ms: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_ms: 30 * 60 * 1000,
            trades_per_symbol_cap: 5_000,
            symbol_cap: 5_000,
            clock_skew_tolerance_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-symbol state
// ---------------------------------------------------------------------------

/// Everything the store knows about one symbol.
#[derive(Debug, Default)]
pub struct SymbolState {
    /// Time-ordered trade buffer; head is the oldest retained trade.
    pub trades: VecDeque<TradeTick>,
    /// Most recent quote for this symbol, if any.
    pub last_quote: Option<QuoteTick>,
    pub last_price: Decimal,
    /// Arrival time of the last accepted event. Monotone non-decreasing.
    pub last_update_ms: i64,
    /// Latest REST-sourced 24 h ticker, if any.
    pub ticker: Option<TickerStats>,
    /// Trades staged for the next aggregation tick.
    pub pending: Vec<TradeTick>,
}

struct Shard {
    symbols: RwLock<HashMap<SymbolKey, SymbolState>>,
}

// ---------------------------------------------------------------------------
// WindowStore
// ---------------------------------------------------------------------------

pub struct WindowStore {
    shards: Vec<Shard>,
    config: WindowConfig,
    symbol_count: AtomicUsize,
    counters: Arc<PipelineCounters>,
    removed_listener: RwLock<Option<SymbolRemovedListener>>,
}

impl WindowStore {
    pub fn new(config: WindowConfig, counters: Arc<PipelineCounters>) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                symbols: RwLock::new(HashMap::new()),
            })
            .collect();
        Self {
            shards,
            config,
            symbol_count: AtomicUsize::new(0),
            counters,
            removed_listener: RwLock::new(None),
        }
    }

    pub fn set_removed_listener(&self, listener: SymbolRemovedListener) {
        *self.removed_listener.write() = Some(listener);
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Number of live symbols. Never exceeds `symbol_cap`.
    pub fn len(&self) -> usize {
        self.symbol_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_for(&self, key: &SymbolKey) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    fn shard_index(&self, key: &SymbolKey) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    // =========================================================================
    // Write path (single consumer)
    // =========================================================================

    /// Apply one event at wall-clock `now_ms`.
    pub fn apply(&self, event: MarketEvent, now_ms: i64) {
        match event {
            MarketEvent::Trade { key, trade } => self.apply_trade(key, trade, now_ms),
            MarketEvent::Quote { key, quote } => self.apply_quote(key, quote, now_ms),
            MarketEvent::Ticker { key, ticker } => self.apply_ticker(key, ticker, now_ms),
        }
    }

    fn apply_trade(&self, key: SymbolKey, trade: TradeTick, now_ms: i64) {
        // Pathological timestamps: count, then drop. A trade from beyond the
        // skew tolerance would be observable in the future; a trade already
        // older than the window would be evicted by the very next write.
        if trade.ts_ms > now_ms + self.config.clock_skew_tolerance_ms
            || trade.ts_ms < now_ms - self.config.window_ms
        {
            PipelineCounters::incr(&self.counters.skewed_timestamps);
            warn!(
                key = %key,
                ts_ms = trade.ts_ms,
                now_ms,
                "trade timestamp outside window/skew bounds — dropped"
            );
            return;
        }

        self.ensure_capacity_for(&key);

        let shard = self.shard_for(&key);
        let mut map = shard.symbols.write();
        let created = !map.contains_key(&key);
        let state = map.entry(key.clone()).or_default();

        // A write may never move last_update backwards.
        if now_ms < state.last_update_ms {
            PipelineCounters::incr(&self.counters.integrity_rejects);
            return;
        }

        let cutoff = now_ms - self.config.window_ms;
        while state.trades.front().is_some_and(|t| t.ts_ms < cutoff) {
            state.trades.pop_front();
        }

        state.trades.push_back(trade.clone());

        while state.trades.len() > self.config.trades_per_symbol_cap {
            state.trades.pop_front();
        }

        state.last_price = trade.price;
        state.last_update_ms = now_ms;
        state.pending.push(trade);

        drop(map);
        if created {
            self.symbol_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_quote(&self, key: SymbolKey, quote: QuoteTick, now_ms: i64) {
        self.ensure_capacity_for(&key);
        let shard = self.shard_for(&key);
        let mut map = shard.symbols.write();
        let created = !map.contains_key(&key);
        let state = map.entry(key).or_default();
        if now_ms < state.last_update_ms {
            PipelineCounters::incr(&self.counters.integrity_rejects);
            return;
        }
        state.last_quote = Some(quote);
        state.last_update_ms = now_ms;
        drop(map);
        if created {
            self.symbol_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_ticker(&self, key: SymbolKey, ticker: TickerStats, now_ms: i64) {
        self.ensure_capacity_for(&key);
        let shard = self.shard_for(&key);
        let mut map = shard.symbols.write();
        let created = !map.contains_key(&key);
        let state = map.entry(key).or_default();
        state.ticker = Some(ticker);
        if now_ms > state.last_update_ms {
            state.last_update_ms = now_ms;
        }
        drop(map);
        if created {
            self.symbol_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict the least-recently-updated symbol if inserting `key` would
    /// exceed the symbol cap. Runs before the insert lock is taken; safe
    /// because the store has a single writer.
    fn ensure_capacity_for(&self, key: &SymbolKey) {
        if self.symbol_count.load(Ordering::Relaxed) < self.config.symbol_cap {
            return;
        }
        if self.shard_for(key).symbols.read().contains_key(key) {
            return;
        }

        // Prefer a victim in the incoming key's shard; fall back to the
        // globally oldest across shards if that shard is empty.
        let home = self.shard_index(key);
        let order = (0..SHARD_COUNT).map(|i| (home + i) % SHARD_COUNT);
        for idx in order {
            let mut map = self.shards[idx].symbols.write();
            let victim = map
                .iter()
                .min_by_key(|(_, s)| s.last_update_ms)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                map.remove(&victim);
                drop(map);
                self.symbol_count.fetch_sub(1, Ordering::Relaxed);
                debug!(evicted = %victim, "symbol cap reached — evicted LRU symbol");
                if let Some(listener) = self.removed_listener.read().as_ref() {
                    listener(&victim);
                }
                return;
            }
        }
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Run `f` against one symbol's state under the shard lock.
    pub fn with_symbol<T>(&self, key: &SymbolKey, f: impl FnOnce(&SymbolState) -> T) -> Option<T> {
        let map = self.shard_for(key).symbols.read();
        map.get(key).map(f)
    }

    /// Visit every symbol. The shard lock is held per shard, not globally.
    pub fn for_each_symbol(&self, mut f: impl FnMut(&SymbolKey, &SymbolState)) {
        for shard in &self.shards {
            let map = shard.symbols.read();
            for (key, state) in map.iter() {
                f(key, state);
            }
        }
    }

    /// Count trades with `ts >= cutoff_ms`, in place.
    pub fn count_since(&self, key: &SymbolKey, cutoff_ms: i64) -> usize {
        self.with_symbol(key, |s| {
            s.trades.iter().filter(|t| t.ts_ms >= cutoff_ms).count()
        })
        .unwrap_or(0)
    }

    /// Copy out the full trade buffer.
    pub fn snapshot_trades(&self, key: &SymbolKey) -> Option<Vec<TradeTick>> {
        self.with_symbol(key, |s| s.trades.iter().cloned().collect())
    }

    pub fn last_quote(&self, key: &SymbolKey) -> Option<QuoteTick> {
        self.with_symbol(key, |s| s.last_quote.clone()).flatten()
    }

    /// Latest trade with `ts <= t_ms` — the backward as-of lookup used by the
    /// alignment engine. Never looks ahead of `t_ms`.
    pub fn last_trade_at_or_before(&self, key: &SymbolKey, t_ms: i64) -> Option<(Decimal, i64)> {
        self.with_symbol(key, |s| {
            s.trades
                .iter()
                .filter(|t| t.ts_ms <= t_ms)
                .max_by_key(|t| t.ts_ms)
                .map(|t| (t.price, t.ts_ms))
        })
        .flatten()
    }

    /// All live symbol keys.
    pub fn symbol_keys(&self) -> Vec<SymbolKey> {
        let mut keys = Vec::with_capacity(self.len());
        for shard in &self.shards {
            keys.extend(shard.symbols.read().keys().cloned());
        }
        keys
    }

    /// Take every non-empty pending-broadcast slice, clearing the staging.
    pub fn drain_pending(&self) -> Vec<(SymbolKey, Vec<TradeTick>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut map = shard.symbols.write();
            for (key, state) in map.iter_mut() {
                if !state.pending.is_empty() {
                    out.push((key.clone(), std::mem::take(&mut state.pending)));
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

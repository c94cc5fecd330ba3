// =============================================================================
// Exchange adapters — one per venue, all speaking the same contract
// =============================================================================
//
// An adapter owns its network connections and decoding state and emits only
// normalized events. Everything upstream of the orchestrator is
// exchange-specific; everything downstream is not.
// =============================================================================

pub mod binance;
pub mod bybit;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ScreenerError;
use crate::market_data::{now_ms, MarketEvent, SymbolInfo, TickerStats};
use crate::types::AdapterHealth;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;

/// The contract every venue adapter implements.
///
/// `subscribe` returns only once `stop` has fired or the venue closed with no
/// recoverable state; transient transport failures are retried internally
/// under the backoff policy.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// REST symbol discovery. Symbol names in the result are normalized.
    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, ScreenerError>;

    /// REST 24 h ticker snapshot, keyed by normalized symbol.
    async fn list_tickers_24h(&self) -> Result<Vec<(String, TickerStats)>, ScreenerError>;

    /// Stream normalized events for `symbols` (normalized names) into `out`
    /// until `stop` fires.
    async fn subscribe(
        &self,
        symbols: Vec<String>,
        out: mpsc::Sender<MarketEvent>,
        stop: CancellationToken,
    ) -> Result<(), ScreenerError>;

    /// Monotonic wall-clock timestamp of the most recent event seen on any of
    /// this adapter's connections.
    fn last_event_ms(&self) -> i64;

    fn health(&self) -> AdapterHealth {
        AdapterHealth::from_idle_ms(now_ms() - self.last_event_ms())
    }
}

// ---------------------------------------------------------------------------
// Shared adapter plumbing
// ---------------------------------------------------------------------------

/// Exponential reconnect backoff: 1 s doubling to a 30 s cap, reset on a
/// successful subscribe.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    /// The delay to sleep before the next attempt; doubles on each call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared heartbeat slot updated by every connection task of an adapter.
#[derive(Debug)]
pub struct Heartbeat(AtomicI64);

impl Heartbeat {
    pub fn new() -> Self {
        Self(AtomicI64::new(now_ms()))
    }

    pub fn beat(&self) {
        self.0.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_ms(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Forced-reconnect threshold: a connection idle this long is torn down.
pub(crate) const IDLE_RECONNECT: Duration = Duration::from_secs(60);

/// Convert a normalized symbol (`BTC_USDT`) to the venue-native compact form
/// (`BTCUSDT`) used by both Binance and Bybit.
pub(crate) fn denormalize(symbol: &str) -> String {
    symbol.replace('_', "")
}

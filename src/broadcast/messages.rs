// =============================================================================
// Wire messages — server ⇄ client payloads, tagged by `type`
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::analytics::{RankedEntry, SignalRecord};
use crate::market_data::TradeTick;
use crate::types::Side;

/// One OHLCV bucket over a batch of staged trades.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OhlcvBucket {
    /// Timestamp of the last trade in the bucket.
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// `Σ price·qty` across the bucket.
    pub volume: Decimal,
    pub trade_count: usize,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
}

/// Deviation entry as transmitted to clients.
#[derive(Debug, Clone, Serialize)]
pub struct DeviationEntry {
    pub symbol: String,
    pub exchange_cheap: String,
    pub exchange_expensive: String,
    pub price_cheap: Decimal,
    pub price_expensive: Decimal,
    pub deviation_pct: Decimal,
    pub is_significant: bool,
    pub is_near_parity: bool,
}

/// Everything the server pushes. The `type` discriminator makes each message
/// self-describing on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    TradeAggregate {
        symbol: String,
        aggregate: OhlcvBucket,
    },
    AllSymbolsScored {
        timestamp_ms: i64,
        total: usize,
        symbols: Vec<RankedEntry>,
    },
    // The capital N is part of the wire contract.
    #[serde(rename = "top_N_update")]
    TopNUpdate {
        timestamp_ms: i64,
        symbols: Vec<String>,
    },
    DeviationUpdate {
        timestamp_ms: i64,
        count: usize,
        deviations: Vec<DeviationEntry>,
    },
    EntrySignal {
        #[serde(flatten)]
        signal: SignalRecord,
    },
    ExitSignal {
        #[serde(flatten)]
        signal: SignalRecord,
    },
}

/// Client → server requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundMessage {
    SubscribePage { page: usize, page_size: usize },
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Fold a batch of staged trades into one OHLCV bucket.
///
/// Single pass: open is the first trade's price, close the last's, volume is
/// the summed notional with its buy/sell split. Returns `None` on an empty
/// batch (empty staging slots produce no message).
pub fn aggregate_trades(trades: &[TradeTick]) -> Option<OhlcvBucket> {
    let first = trades.first()?;
    let mut bucket = OhlcvBucket {
        timestamp_ms: first.ts_ms,
        open: first.price,
        high: first.price,
        low: first.price,
        close: first.price,
        volume: Decimal::ZERO,
        trade_count: trades.len(),
        buy_volume: Decimal::ZERO,
        sell_volume: Decimal::ZERO,
    };

    for trade in trades {
        bucket.high = bucket.high.max(trade.price);
        bucket.low = bucket.low.min(trade.price);
        bucket.close = trade.price;
        bucket.timestamp_ms = trade.ts_ms;
        let notional = trade.usd_value();
        bucket.volume += notional;
        match trade.side {
            Side::Buy => bucket.buy_volume += notional,
            Side::Sell => bucket.sell_volume += notional,
        }
    }
    Some(bucket)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

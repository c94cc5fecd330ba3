// =============================================================================
// Event model — uniform trade/quote/ticker events + symbol normalization
// =============================================================================
//
// Every adapter emits these normalized events; nothing downstream ever sees an
// exchange-specific payload. Prices and quantities are fixed-point decimals.
// Timestamps are UNIX milliseconds; the exchange's server time is
// authoritative and the local receive time is the fallback.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ScreenerError;
use crate::types::Side;

/// Current wall-clock time in UNIX milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a raw exchange symbol into its canonical form.
///
/// Strips `/`, `-`, `_` and spaces, uppercases, and inserts a `_` before a
/// trailing `USDT`/`USDC` quote: `"btc/usdt"` → `"BTC_USDT"`. Idempotent.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s: String = raw
        .chars()
        .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
        .collect::<String>()
        .to_uppercase();

    for quote in ["USDT", "USDC"] {
        if s.ends_with(quote) && s.len() > quote.len() {
            s.insert(s.len() - quote.len(), '_');
            break;
        }
    }
    s
}

/// Identity of a tradable pair: `(exchange, normalized symbol)`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SymbolKey {
    pub exchange: String,
    pub symbol: String,
}

impl SymbolKey {
    /// Build a key, normalizing `raw_symbol` in the process.
    pub fn new(exchange: impl Into<String>, raw_symbol: &str) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: normalize_symbol(raw_symbol),
        }
    }
}

impl std::fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// One executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub price: Decimal,
    pub qty: Decimal,
    pub side: Side,
    /// Effective event time: server time when provided, local receive time
    /// otherwise.
    pub ts_ms: i64,
}

impl TradeTick {
    pub fn new(
        price: Decimal,
        qty: Decimal,
        side: Side,
        ts_server_ms: Option<i64>,
        ts_local_ms: i64,
    ) -> Result<Self, ScreenerError> {
        if price <= Decimal::ZERO {
            return Err(ScreenerError::MalformedEvent(format!(
                "non-positive trade price {price}"
            )));
        }
        if qty <= Decimal::ZERO {
            return Err(ScreenerError::MalformedEvent(format!(
                "non-positive trade qty {qty}"
            )));
        }
        Ok(Self {
            price,
            qty,
            side,
            ts_ms: ts_server_ms.unwrap_or(ts_local_ms),
        })
    }

    /// Quote-denominated notional of this trade.
    pub fn usd_value(&self) -> Decimal {
        self.price * self.qty
    }
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_qty: Option<Decimal>,
    pub ask_qty: Option<Decimal>,
    pub ts_ms: i64,
}

impl QuoteTick {
    pub fn new(
        bid: Decimal,
        ask: Decimal,
        bid_qty: Option<Decimal>,
        ask_qty: Option<Decimal>,
        ts_server_ms: Option<i64>,
        ts_local_ms: i64,
    ) -> Result<Self, ScreenerError> {
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            return Err(ScreenerError::MalformedEvent(format!(
                "non-positive quote bid={bid} ask={ask}"
            )));
        }
        Ok(Self {
            bid,
            ask,
            bid_qty,
            ask_qty,
            ts_ms: ts_server_ms.unwrap_or(ts_local_ms),
        })
    }
}

/// REST-sourced 24 h ticker, refreshed periodically by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerStats {
    pub quote_volume_24h: Decimal,
    pub price_change_pct_24h: Decimal,
    pub last_price: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

/// Static symbol facts from exchange discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Normalized symbol name.
    pub symbol: String,
    pub price_step: Decimal,
    pub qty_step: Decimal,
    pub min_notional: Decimal,
}

// ---------------------------------------------------------------------------
// The uniform event stream
// ---------------------------------------------------------------------------

/// The single event type consumed by the rolling-window store.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade { key: SymbolKey, trade: TradeTick },
    Quote { key: SymbolKey, quote: QuoteTick },
    Ticker { key: SymbolKey, ticker: TickerStats },
}

impl MarketEvent {
    pub fn key(&self) -> &SymbolKey {
        match self {
            Self::Trade { key, .. } | Self::Quote { key, .. } | Self::Ticker { key, .. } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normalize_variants_agree() {
        assert_eq!(normalize_symbol("btc/usdt"), "BTC_USDT");
        assert_eq!(normalize_symbol("BTC_USDT"), "BTC_USDT");
        assert_eq!(normalize_symbol("btc-usdt"), "BTC_USDT");
        assert_eq!(normalize_symbol("btc usdt"), "BTC_USDT");
        assert_eq!(normalize_symbol("ethusdc"), "ETH_USDC");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["btc/usdt", "SOL-USDC", "weird__pair", "BTCETH", "usdt"] {
            let once = normalize_symbol(raw);
            assert_eq!(normalize_symbol(&once), once, "raw = {raw}");
        }
    }

    #[test]
    fn normalize_leaves_non_stable_quotes_alone() {
        assert_eq!(normalize_symbol("ETHBTC"), "ETHBTC");
        // A bare quote currency is not split.
        assert_eq!(normalize_symbol("usdt"), "USDT");
    }

    #[test]
    fn trade_constructor_rejects_non_positive() {
        let bad_price = TradeTick::new(dec!(0), dec!(1), Side::Buy, None, 1_000);
        assert!(matches!(
            bad_price,
            Err(ScreenerError::MalformedEvent(_))
        ));
        let bad_qty = TradeTick::new(dec!(10), dec!(-1), Side::Sell, None, 1_000);
        assert!(bad_qty.is_err());
    }

    #[test]
    fn trade_server_ts_wins_over_local() {
        let t = TradeTick::new(dec!(10), dec!(1), Side::Buy, Some(500), 900).unwrap();
        assert_eq!(t.ts_ms, 500);
        let t = TradeTick::new(dec!(10), dec!(1), Side::Buy, None, 900).unwrap();
        assert_eq!(t.ts_ms, 900);
    }

    #[test]
    fn quote_constructor_rejects_zero_bid() {
        assert!(QuoteTick::new(dec!(0), dec!(1), None, None, None, 0).is_err());
    }

    #[test]
    fn symbol_key_normalizes() {
        let key = SymbolKey::new("binance", "btc/usdt");
        assert_eq!(key.symbol, "BTC_USDT");
        assert_eq!(key.to_string(), "binance:BTC_USDT");
    }
}

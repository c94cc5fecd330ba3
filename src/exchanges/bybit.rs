// =============================================================================
// Bybit spot adapter — v5 public WebSocket + REST discovery
// =============================================================================
//
// Unlike Binance, Bybit subscribes with explicit `{"op":"subscribe"}` frames
// after connecting (at most SUBSCRIBE_BATCH topics per frame) and expects an
// application-level ping every 20 s. Trades arrive batched per message.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{PipelineCounters, ScreenerError};
use crate::exchanges::{denormalize, Backoff, ExchangeAdapter, Heartbeat, IDLE_RECONNECT};
use crate::market_data::{
    now_ms, MarketEvent, QuoteTick, SymbolInfo, SymbolKey, TickerStats, TradeTick,
};
use crate::runtime_config::StreamsConfig;
use crate::types::Side;

const EXCHANGE: &str = "bybit";

/// Symbols per connection.
const CHUNK_SIZE: usize = 200;
/// Topics per subscribe frame.
const SUBSCRIBE_BATCH: usize = 10;
/// Bybit closes connections that stay silent; ping well inside its 20 s rule.
const PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct BybitAdapter {
    http: reqwest::Client,
    rest_base: String,
    ws_url: String,
    streams: StreamsConfig,
    heartbeat: Arc<Heartbeat>,
    counters: Arc<PipelineCounters>,
}

impl BybitAdapter {
    pub fn new(streams: StreamsConfig, counters: Arc<PipelineCounters>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            rest_base: "https://api.bybit.com".to_string(),
            ws_url: "wss://stream.bybit.com/v5/public/spot".to_string(),
            streams,
            heartbeat: Arc::new(Heartbeat::new()),
            counters,
        }
    }

    /// Topic list for one chunk of normalized symbols.
    fn topics(&self, symbols: &[String]) -> Vec<String> {
        let mut topics = Vec::with_capacity(symbols.len() * 2);
        for sym in symbols {
            let native = denormalize(sym);
            if self.streams.enable_trades {
                topics.push(format!("publicTrade.{native}"));
            }
            if self.streams.enable_quotes {
                topics.push(format!("tickers.{native}"));
            }
        }
        topics
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        EXCHANGE
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, ScreenerError> {
        let url = format!(
            "{}/v5/market/instruments-info?category=spot&limit=1000",
            self.rest_base
        );
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;

        let raw = body["result"]["list"]
            .as_array()
            .ok_or_else(|| ScreenerError::Protocol("instruments-info missing list".into()))?;

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            if entry["status"].as_str() != Some("Trading") {
                continue;
            }
            let Some(name) = entry["symbol"].as_str() else {
                continue;
            };
            out.push(SymbolInfo {
                symbol: crate::market_data::normalize_symbol(name),
                price_step: nested_decimal(entry, "priceFilter", "tickSize"),
                qty_step: nested_decimal(entry, "lotSizeFilter", "basePrecision"),
                min_notional: nested_decimal(entry, "lotSizeFilter", "minOrderAmt"),
            });
        }
        debug!(count = out.len(), "bybit symbols discovered");
        Ok(out)
    }

    async fn list_tickers_24h(&self) -> Result<Vec<(String, TickerStats)>, ScreenerError> {
        let url = format!("{}/v5/market/tickers?category=spot", self.rest_base);
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;

        let raw = body["result"]["list"]
            .as_array()
            .ok_or_else(|| ScreenerError::Protocol("tickers missing list".into()))?;

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(symbol) = entry["symbol"].as_str() else {
                continue;
            };
            // price24hPcnt is a fraction ("0.0405"); wire model carries percent.
            let pct_fraction: Decimal = entry["price24hPcnt"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let stats = TickerStats {
                quote_volume_24h: str_decimal(entry, "turnover24h"),
                price_change_pct_24h: pct_fraction * dec!(100),
                last_price: str_decimal(entry, "lastPrice"),
                best_bid: positive_str_decimal(entry, "bid1Price"),
                best_ask: positive_str_decimal(entry, "ask1Price"),
            };
            out.push((crate::market_data::normalize_symbol(symbol), stats));
        }
        Ok(out)
    }

    async fn subscribe(
        &self,
        symbols: Vec<String>,
        out: mpsc::Sender<MarketEvent>,
        stop: CancellationToken,
    ) -> Result<(), ScreenerError> {
        if symbols.is_empty() {
            info!("bybit subscribe called with no symbols — nothing to do");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for chunk in symbols.chunks(CHUNK_SIZE) {
            let topics = self.topics(chunk);
            let url = self.ws_url.clone();
            let out = out.clone();
            let stop = stop.clone();
            let heartbeat = self.heartbeat.clone();
            let counters = self.counters.clone();
            tasks.spawn(async move {
                info!(topics = topics.len(), "bybit stream connection starting");
                run_chunk(url, topics, out, stop, heartbeat, counters).await;
            });
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    fn last_event_ms(&self) -> i64 {
        self.heartbeat.last_ms()
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

async fn run_chunk(
    url: String,
    topics: Vec<String>,
    out: mpsc::Sender<MarketEvent>,
    stop: CancellationToken,
    heartbeat: Arc<Heartbeat>,
    counters: Arc<PipelineCounters>,
) {
    let mut backoff = Backoff::new();
    loop {
        if stop.is_cancelled() {
            return;
        }
        match run_connection(&url, &topics, &out, &stop, &heartbeat, &counters).await {
            Ok(()) => {
                if stop.is_cancelled() {
                    return;
                }
                backoff.reset();
            }
            Err(e) => {
                PipelineCounters::incr(&counters.transport_errors);
                warn!(error = %e, "bybit stream error — reconnecting");
            }
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_connection(
    url: &str,
    topics: &[String],
    out: &mpsc::Sender<MarketEvent>,
    stop: &CancellationToken,
    heartbeat: &Heartbeat,
    counters: &PipelineCounters,
) -> Result<(), ScreenerError> {
    let (ws_stream, _response) = connect_async(url).await?;
    debug!("bybit stream connected");
    let (mut write, mut read) = ws_stream.split();

    for batch in topics.chunks(SUBSCRIBE_BATCH) {
        let frame = json!({ "op": "subscribe", "args": batch }).to_string();
        write
            .send(Message::Text(frame))
            .await
            .map_err(ScreenerError::Transport)?;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = ping.tick() => {
                let frame = json!({ "op": "ping" }).to_string();
                write
                    .send(Message::Text(frame))
                    .await
                    .map_err(ScreenerError::Transport)?;
                continue;
            }
            next = tokio::time::timeout(IDLE_RECONNECT, read.next()) => next,
        };

        let msg = match next {
            Err(_elapsed) => {
                return Err(ScreenerError::Protocol(
                    "no events within idle window — forcing reconnect".into(),
                ));
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        if let Message::Text(text) = msg {
            heartbeat.beat();
            match parse_stream_message(&text, now_ms()) {
                Ok(events) => {
                    for event in events {
                        if out.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(ScreenerError::MalformedEvent(e)) => {
                    PipelineCounters::incr(&counters.malformed_events);
                    warn!(error = %e, "bybit malformed event dropped");
                }
                Err(e) => {
                    PipelineCounters::incr(&counters.protocol_errors);
                    warn!(error = %e, "bybit undecodable message dropped");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

/// Decode one Bybit public message. Trades arrive as an array; quote updates
/// ride the `tickers` topic. Acks and pong replies decode to no events.
fn parse_stream_message(text: &str, local_ms: i64) -> Result<Vec<MarketEvent>, ScreenerError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ScreenerError::Protocol(format!("invalid JSON: {e}")))?;

    let Some(topic) = root["topic"].as_str() else {
        return Ok(Vec::new());
    };

    if topic.starts_with("publicTrade.") {
        let rows = root["data"]
            .as_array()
            .ok_or_else(|| ScreenerError::Protocol("publicTrade data is not an array".into()))?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let symbol = row["s"]
                .as_str()
                .ok_or_else(|| ScreenerError::Protocol("trade missing s".into()))?;
            let side = match row["S"].as_str() {
                Some("Buy") => Side::Buy,
                Some("Sell") => Side::Sell,
                other => {
                    return Err(ScreenerError::MalformedEvent(format!(
                        "unknown side token {other:?}"
                    )))
                }
            };
            let price = str_decimal_required(row, "p")?;
            let qty = str_decimal_required(row, "v")?;
            let trade = TradeTick::new(price, qty, side, row["T"].as_i64(), local_ms)?;
            events.push(MarketEvent::Trade {
                key: SymbolKey::new(EXCHANGE, symbol),
                trade,
            });
        }
        return Ok(events);
    }

    if topic.starts_with("tickers.") {
        let data = &root["data"];
        let Some(symbol) = data["symbol"].as_str() else {
            return Err(ScreenerError::Protocol("ticker missing symbol".into()));
        };
        // Delta frames may omit the book fields; emit only complete quotes.
        let (Some(bid), Some(ask)) = (
            positive_str_decimal(data, "bid1Price"),
            positive_str_decimal(data, "ask1Price"),
        ) else {
            return Ok(Vec::new());
        };
        let quote = QuoteTick::new(
            bid,
            ask,
            positive_str_decimal(data, "bid1Size"),
            positive_str_decimal(data, "ask1Size"),
            root["ts"].as_i64(),
            local_ms,
        )?;
        return Ok(vec![MarketEvent::Quote {
            key: SymbolKey::new(EXCHANGE, symbol),
            quote,
        }]);
    }

    Ok(Vec::new())
}

fn str_decimal(entry: &serde_json::Value, name: &str) -> Decimal {
    entry[name]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

fn str_decimal_required(entry: &serde_json::Value, name: &str) -> Result<Decimal, ScreenerError> {
    entry[name]
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ScreenerError::Protocol(format!("field {name} is not a decimal")))
}

fn positive_str_decimal(entry: &serde_json::Value, name: &str) -> Option<Decimal> {
    entry[name]
        .as_str()
        .and_then(|s| s.parse::<Decimal>().ok())
        .filter(|d| *d > Decimal::ZERO)
}

fn nested_decimal(entry: &serde_json::Value, outer: &str, field: &str) -> Decimal {
    entry[outer][field]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trade_batch() {
        let json = r#"{
            "topic": "publicTrade.BTCUSDT",
            "type": "snapshot",
            "ts": 1672304486868,
            "data": [
                { "T": 1672304486865, "s": "BTCUSDT", "S": "Buy",
                  "v": "0.001", "p": "16578.50" },
                { "T": 1672304486866, "s": "BTCUSDT", "S": "Sell",
                  "v": "0.002", "p": "16578.40" }
            ]
        }"#;
        let events = parse_stream_message(json, 0).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            MarketEvent::Trade { key, trade } => {
                assert_eq!(key.exchange, "bybit");
                assert_eq!(key.symbol, "BTC_USDT");
                assert_eq!(trade.side, Side::Buy);
                assert_eq!(trade.price, dec!(16578.50));
                assert_eq!(trade.ts_ms, 1672304486865);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parse_ticker_quote() {
        let json = r#"{
            "topic": "tickers.ETHUSDT",
            "ts": 1700000000500,
            "type": "snapshot",
            "data": { "symbol": "ETHUSDT", "lastPrice": "2000.1",
                      "bid1Price": "2000.0", "bid1Size": "5",
                      "ask1Price": "2000.2", "ask1Size": "7",
                      "price24hPcnt": "0.0405" }
        }"#;
        let events = parse_stream_message(json, 0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::Quote { key, quote } => {
                assert_eq!(key.symbol, "ETH_USDT");
                assert_eq!(quote.bid, dec!(2000.0));
                assert_eq!(quote.ask, dec!(2000.2));
                assert_eq!(quote.ts_ms, 1700000000500);
            }
            other => panic!("expected quote, got {other:?}"),
        }
    }

    #[test]
    fn delta_ticker_without_book_fields_emits_nothing() {
        let json = r#"{
            "topic": "tickers.ETHUSDT",
            "ts": 1,
            "type": "delta",
            "data": { "symbol": "ETHUSDT", "lastPrice": "2000.1" }
        }"#;
        assert!(parse_stream_message(json, 0).unwrap().is_empty());
    }

    #[test]
    fn pong_ack_is_ignored() {
        let json = r#"{ "success": true, "ret_msg": "pong", "op": "ping" }"#;
        assert!(parse_stream_message(json, 0).unwrap().is_empty());
    }

    #[test]
    fn unknown_side_is_malformed() {
        let json = r#"{
            "topic": "publicTrade.BTCUSDT",
            "data": [ { "T": 1, "s": "BTCUSDT", "S": "Hold", "v": "1", "p": "2" } ]
        }"#;
        assert!(matches!(
            parse_stream_message(json, 0),
            Err(ScreenerError::MalformedEvent(_))
        ));
    }

    #[test]
    fn topics_include_both_stream_kinds() {
        let adapter = BybitAdapter::new(
            StreamsConfig::default(),
            Arc::new(PipelineCounters::default()),
        );
        let topics = adapter.topics(&["BTC_USDT".into()]);
        assert_eq!(
            topics,
            vec!["publicTrade.BTCUSDT".to_string(), "tickers.BTCUSDT".to_string()]
        );
    }
}

// =============================================================================
// Binance spot adapter — combined WebSocket streams + public REST discovery
// =============================================================================
//
// Streaming uses combined-stream URLs (`/stream?streams=btcusdt@trade/...`)
// with at most `CHUNK_SIZE` symbols per connection; larger symbol sets are
// sharded across parallel connections. Each connection reconnects
// independently under the shared backoff policy.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
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

const EXCHANGE: &str = "binance";

/// Streams per connection stay well under Binance's per-connection cap while
/// keeping the per-socket message rate manageable.
const CHUNK_SIZE: usize = 100;

pub struct BinanceAdapter {
    http: reqwest::Client,
    rest_base: String,
    ws_base: String,
    streams: StreamsConfig,
    heartbeat: Arc<Heartbeat>,
    counters: Arc<PipelineCounters>,
}

impl BinanceAdapter {
    pub fn new(streams: StreamsConfig, counters: Arc<PipelineCounters>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            rest_base: "https://api.binance.com".to_string(),
            ws_base: "wss://stream.binance.com:9443".to_string(),
            streams,
            heartbeat: Arc::new(Heartbeat::new()),
            counters,
        }
    }

    /// Build the combined-stream URL for one chunk of normalized symbols.
    fn stream_url(&self, symbols: &[String]) -> String {
        let mut names: Vec<String> = Vec::with_capacity(symbols.len() * 2);
        for sym in symbols {
            let native = denormalize(sym).to_lowercase();
            if self.streams.enable_trades {
                names.push(format!("{native}@trade"));
            }
            if self.streams.enable_quotes {
                names.push(format!("{native}@bookTicker"));
            }
        }
        format!("{}/stream?streams={}", self.ws_base, names.join("/"))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        EXCHANGE
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, ScreenerError> {
        let url = format!("{}/api/v3/exchangeInfo", self.rest_base);
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;

        let raw = body["symbols"]
            .as_array()
            .ok_or_else(|| ScreenerError::Protocol("exchangeInfo missing symbols".into()))?;

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            if entry["status"].as_str() != Some("TRADING") {
                continue;
            }
            let Some(name) = entry["symbol"].as_str() else {
                continue;
            };
            out.push(SymbolInfo {
                symbol: crate::market_data::normalize_symbol(name),
                price_step: filter_decimal(entry, "PRICE_FILTER", "tickSize"),
                qty_step: filter_decimal(entry, "LOT_SIZE", "stepSize"),
                min_notional: filter_decimal(entry, "NOTIONAL", "minNotional"),
            });
        }
        debug!(count = out.len(), "binance symbols discovered");
        Ok(out)
    }

    async fn list_tickers_24h(&self) -> Result<Vec<(String, TickerStats)>, ScreenerError> {
        let url = format!("{}/api/v3/ticker/24hr", self.rest_base);
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ScreenerError::Protocol("ticker/24hr is not an array".into()))?;

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(symbol) = entry["symbol"].as_str() else {
                continue;
            };
            let stats = TickerStats {
                quote_volume_24h: decimal_field(entry, "quoteVolume"),
                price_change_pct_24h: decimal_field(entry, "priceChangePercent"),
                last_price: decimal_field(entry, "lastPrice"),
                best_bid: positive_decimal_field(entry, "bidPrice"),
                best_ask: positive_decimal_field(entry, "askPrice"),
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
            info!("binance subscribe called with no symbols — nothing to do");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for chunk in symbols.chunks(CHUNK_SIZE) {
            let url = self.stream_url(chunk);
            let out = out.clone();
            let stop = stop.clone();
            let heartbeat = self.heartbeat.clone();
            let counters = self.counters.clone();
            let count = chunk.len();
            tasks.spawn(async move {
                info!(symbols = count, "binance stream connection starting");
                run_chunk(url, out, stop, heartbeat, counters).await;
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

/// Reconnect-forever loop for one chunk connection. Exits when `stop` fires.
async fn run_chunk(
    url: String,
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
        match run_connection(&url, &out, &stop, &heartbeat, &counters).await {
            Ok(()) => {
                if stop.is_cancelled() {
                    return;
                }
                // Remote closed cleanly; resubscribe immediately-ish.
                backoff.reset();
            }
            Err(e) => {
                PipelineCounters::incr(&counters.transport_errors);
                warn!(error = %e, "binance stream error — reconnecting");
            }
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection lifetime: connect, read until stop/idle/error.
async fn run_connection(
    url: &str,
    out: &mpsc::Sender<MarketEvent>,
    stop: &CancellationToken,
    heartbeat: &Heartbeat,
    counters: &PipelineCounters,
) -> Result<(), ScreenerError> {
    let (ws_stream, _response) = connect_async(url).await?;
    debug!("binance stream connected");
    let (mut write, mut read) = ws_stream.split();

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
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

        match msg {
            Message::Text(text) => {
                heartbeat.beat();
                match parse_stream_message(&text, now_ms()) {
                    Ok(Some(event)) => {
                        if out.send(event).await.is_err() {
                            // Receiver gone — shutting down.
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(ScreenerError::MalformedEvent(e)) => {
                        PipelineCounters::incr(&counters.malformed_events);
                        warn!(error = %e, "binance malformed event dropped");
                    }
                    Err(e) => {
                        PipelineCounters::incr(&counters.protocol_errors);
                        warn!(error = %e, "binance undecodable message dropped");
                    }
                }
            }
            Message::Ping(data) => {
                if write.send(Message::Pong(data)).await.is_err() {
                    return Err(ScreenerError::Protocol("pong send failed".into()));
                }
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

/// Decode one combined-stream message into a normalized event.
///
/// Trade shape:
/// ```json
/// { "stream": "btcusdt@trade",
///   "data": { "e":"trade", "s":"BTCUSDT", "p":"37000.1", "q":"0.5",
///             "T": 1700000000000, "m": false } }
/// ```
/// Book-ticker shape:
/// ```json
/// { "stream": "btcusdt@bookTicker",
///   "data": { "s":"BTCUSDT", "b":"36999.9", "B":"2.1",
///             "a":"37000.1", "A":"1.3" } }
/// ```
fn parse_stream_message(text: &str, local_ms: i64) -> Result<Option<MarketEvent>, ScreenerError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ScreenerError::Protocol(format!("invalid JSON: {e}")))?;

    let Some(stream) = root["stream"].as_str() else {
        // Subscription acks and other control payloads.
        return Ok(None);
    };
    let data = &root["data"];

    if stream.ends_with("@trade") {
        let symbol = str_field(data, "s")?;
        let price = parse_decimal(data, "p")?;
        let qty = parse_decimal(data, "q")?;
        // `m` is "buyer is maker": the taker was selling.
        let side = if data["m"].as_bool().unwrap_or(false) {
            Side::Sell
        } else {
            Side::Buy
        };
        let ts_server = data["T"].as_i64();
        let trade = TradeTick::new(price, qty, side, ts_server, local_ms)?;
        return Ok(Some(MarketEvent::Trade {
            key: SymbolKey::new(EXCHANGE, symbol),
            trade,
        }));
    }

    if stream.ends_with("@bookTicker") {
        let symbol = str_field(data, "s")?;
        let bid = parse_decimal(data, "b")?;
        let ask = parse_decimal(data, "a")?;
        let bid_qty = data["B"].as_str().and_then(|s| s.parse().ok());
        let ask_qty = data["A"].as_str().and_then(|s| s.parse().ok());
        let quote = QuoteTick::new(bid, ask, bid_qty, ask_qty, None, local_ms)?;
        return Ok(Some(MarketEvent::Quote {
            key: SymbolKey::new(EXCHANGE, symbol),
            quote,
        }));
    }

    Ok(None)
}

fn str_field<'a>(data: &'a serde_json::Value, name: &str) -> Result<&'a str, ScreenerError> {
    data[name]
        .as_str()
        .ok_or_else(|| ScreenerError::Protocol(format!("missing field {name}")))
}

fn parse_decimal(data: &serde_json::Value, name: &str) -> Result<Decimal, ScreenerError> {
    str_field(data, name)?
        .parse::<Decimal>()
        .map_err(|e| ScreenerError::Protocol(format!("field {name} is not a decimal: {e}")))
}

/// Pull a decimal out of a symbol's `filters` array in exchangeInfo.
fn filter_decimal(entry: &serde_json::Value, filter_type: &str, field: &str) -> Decimal {
    entry["filters"]
        .as_array()
        .and_then(|filters| {
            filters
                .iter()
                .find(|f| f["filterType"].as_str() == Some(filter_type))
        })
        .and_then(|f| f[field].as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

fn decimal_field(entry: &serde_json::Value, name: &str) -> Decimal {
    entry[name]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

fn positive_decimal_field(entry: &serde_json::Value, name: &str) -> Option<Decimal> {
    entry[name]
        .as_str()
        .and_then(|s| s.parse::<Decimal>().ok())
        .filter(|d| *d > Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// =============================================================================
// Ingestion orchestrator — discovery, filtering, supervision, fan-in
// =============================================================================
//
// One supervisor per configured exchange. Each supervisor discovers symbols
// over REST, filters them by 24 h volume band and exclusion lists, starts the
// adapter on a bounded output channel, and forwards events into the single
// process-wide ingestion channel. A worker failure never touches its
// siblings: the supervisor restarts its own exchange after a bounded delay.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{PipelineCounters, ScreenerError};
use crate::exchanges::{Backoff, ExchangeAdapter};
use crate::market_data::{now_ms, MarketEvent, SymbolInfo, SymbolKey, TickerStats};
use crate::runtime_config::ExchangeConfig;
use crate::types::{AdapterHealth, ExchangeStatus};

/// Capacity of each adapter's private output channel.
const ADAPTER_CHANNEL_CAPACITY: usize = 10_000;

/// How often the 24 h ticker snapshot is refreshed.
const TICKER_REFRESH: Duration = Duration::from_secs(60);

/// Per-exchange view for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatusReport {
    pub exchange: String,
    pub status: ExchangeStatus,
    pub health: AdapterHealth,
    pub last_event_age_ms: i64,
    pub subscribed_symbols: usize,
}

pub struct Orchestrator {
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
    exchange_configs: HashMap<String, ExchangeConfig>,
    statuses: Arc<RwLock<HashMap<String, ExchangeStatus>>>,
    subscribed: Arc<RwLock<HashMap<String, usize>>>,
    event_tx: mpsc::Sender<MarketEvent>,
    counters: Arc<PipelineCounters>,
    token: CancellationToken,
    restart_delay: Duration,
}

impl Orchestrator {
    pub fn new(
        adapters: Vec<Arc<dyn ExchangeAdapter>>,
        exchange_configs: HashMap<String, ExchangeConfig>,
        event_tx: mpsc::Sender<MarketEvent>,
        counters: Arc<PipelineCounters>,
        token: CancellationToken,
    ) -> Self {
        let statuses = exchange_configs
            .keys()
            .map(|name| (name.clone(), ExchangeStatus::NotStarted))
            .collect();
        Self {
            adapters,
            exchange_configs,
            statuses: Arc::new(RwLock::new(statuses)),
            subscribed: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            counters,
            token,
            restart_delay: Duration::from_secs(5),
        }
    }

    /// Shorten the supervisor restart delay (tests).
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Launch one supervisor per configured exchange that has an adapter.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (name, cfg) in &self.exchange_configs {
            let Some(adapter) = self.adapter_by_name(name) else {
                warn!(exchange = %name, "configured exchange has no adapter — skipping");
                continue;
            };
            let worker = SupervisedExchange {
                name: name.clone(),
                cfg: cfg.clone(),
                adapter,
                major: cfg
                    .exclude_if_listed_on
                    .as_deref()
                    .and_then(|m| self.adapter_by_name(m)),
                statuses: self.statuses.clone(),
                subscribed: self.subscribed.clone(),
                event_tx: self.event_tx.clone(),
                counters: self.counters.clone(),
                token: self.token.clone(),
                restart_delay: self.restart_delay,
            };
            handles.push(tokio::spawn(worker.supervise()));
        }
        handles
    }

    pub fn status(&self, exchange: &str) -> ExchangeStatus {
        self.statuses
            .read()
            .get(exchange)
            .copied()
            .unwrap_or_default()
    }

    pub fn status_reports(&self) -> Vec<ExchangeStatusReport> {
        let statuses = self.statuses.read();
        let subscribed = self.subscribed.read();
        let mut reports: Vec<ExchangeStatusReport> = statuses
            .iter()
            .map(|(name, status)| {
                let (health, age) = self
                    .adapter_by_name(name)
                    .map(|a| (a.health(), now_ms() - a.last_event_ms()))
                    .unwrap_or((AdapterHealth::Dead, i64::MAX));
                ExchangeStatusReport {
                    exchange: name.clone(),
                    status: *status,
                    health,
                    last_event_age_ms: age,
                    subscribed_symbols: subscribed.get(name).copied().unwrap_or(0),
                }
            })
            .collect();
        reports.sort_by(|a, b| a.exchange.cmp(&b.exchange));
        reports
    }

    fn adapter_by_name(&self, name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Per-exchange supervisor
// ---------------------------------------------------------------------------

struct SupervisedExchange {
    name: String,
    cfg: ExchangeConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    /// Adapter of the designated "major" exchange, when cross-exchange
    /// exclusion is configured.
    major: Option<Arc<dyn ExchangeAdapter>>,
    statuses: Arc<RwLock<HashMap<String, ExchangeStatus>>>,
    subscribed: Arc<RwLock<HashMap<String, usize>>>,
    event_tx: mpsc::Sender<MarketEvent>,
    counters: Arc<PipelineCounters>,
    token: CancellationToken,
    restart_delay: Duration,
}

impl SupervisedExchange {
    fn set_status(&self, status: ExchangeStatus) {
        self.statuses.write().insert(self.name.clone(), status);
    }

    async fn supervise(self) {
        loop {
            if self.token.is_cancelled() {
                self.set_status(ExchangeStatus::Stopped);
                return;
            }
            self.set_status(ExchangeStatus::Running);
            info!(exchange = %self.name, "exchange worker starting");

            match self.run_once().await {
                Ok(()) => {
                    self.set_status(ExchangeStatus::Stopped);
                    info!(exchange = %self.name, "exchange worker stopped");
                    return;
                }
                Err(e) => {
                    self.set_status(ExchangeStatus::Failed);
                    error!(
                        exchange = %self.name,
                        error = %e,
                        "exchange worker failed — restarting after delay"
                    );
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    self.set_status(ExchangeStatus::Stopped);
                    return;
                }
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }

    /// One full worker lifetime: discover, filter, subscribe, forward.
    async fn run_once(&self) -> Result<(), ScreenerError> {
        let (infos, tickers) = self.discover().await?;

        let major_listings = match &self.major {
            Some(major) => match major.list_symbols().await {
                Ok(infos) => Some(infos.into_iter().map(|i| i.symbol).collect::<HashSet<_>>()),
                Err(e) => {
                    warn!(
                        exchange = %self.name,
                        major = major.name(),
                        error = %e,
                        "major exchange listing unavailable — cross-exchange filter skipped"
                    );
                    None
                }
            },
            None => None,
        };

        let ticker_map: HashMap<String, TickerStats> = tickers.into_iter().collect();
        let symbols = filter_symbols(&infos, &ticker_map, &self.cfg, major_listings.as_ref());
        info!(
            exchange = %self.name,
            discovered = infos.len(),
            selected = symbols.len(),
            "symbol discovery complete"
        );
        self.subscribed
            .write()
            .insert(self.name.clone(), symbols.len());

        // Seed the store with the current 24 h stats for selected symbols.
        let selected: HashSet<&String> = symbols.iter().collect();
        for (symbol, stats) in ticker_map.iter().filter(|(s, _)| selected.contains(s)) {
            self.forward(MarketEvent::Ticker {
                key: SymbolKey::new(self.name.clone(), symbol),
                ticker: stats.clone(),
            });
        }

        let child = self.token.child_token();

        // Periodic ticker refresh for the subscribed set.
        let refresh = {
            let adapter = self.adapter.clone();
            let event_tx = self.event_tx.clone();
            let counters = self.counters.clone();
            let exchange = self.name.clone();
            let selected: HashSet<String> = symbols.iter().cloned().collect();
            let child = child.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TICKER_REFRESH);
                interval.tick().await; // the seed above covers t=0
                loop {
                    tokio::select! {
                        _ = child.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    match adapter.list_tickers_24h().await {
                        Ok(tickers) => {
                            for (symbol, stats) in tickers {
                                if !selected.contains(&symbol) {
                                    continue;
                                }
                                let event = MarketEvent::Ticker {
                                    key: SymbolKey::new(exchange.clone(), &symbol),
                                    ticker: stats,
                                };
                                if event_tx.try_send(event).is_err() {
                                    PipelineCounters::incr(&counters.backpressure_drops);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(exchange = %exchange, error = %e, "ticker refresh failed")
                        }
                    }
                }
            })
        };

        // Bounded adapter output, forwarded into the ingestion channel with
        // drop-newest on overflow.
        let (out_tx, mut out_rx) = mpsc::channel::<MarketEvent>(ADAPTER_CHANNEL_CAPACITY);
        let forwarder = {
            let event_tx = self.event_tx.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                while let Some(event) = out_rx.recv().await {
                    if event_tx.try_send(event).is_err() {
                        PipelineCounters::incr(&counters.backpressure_drops);
                    }
                }
            })
        };

        let result = self.adapter.subscribe(symbols, out_tx, child.clone()).await;

        child.cancel();
        refresh.abort();
        // The adapter dropped its sender; let the forwarder drain and finish.
        let _ = forwarder.await;

        result
    }

    /// Discovery with retry under backoff, bounded by the stop token.
    async fn discover(
        &self,
    ) -> Result<(Vec<SymbolInfo>, Vec<(String, TickerStats)>), ScreenerError> {
        let mut backoff = Backoff::new();
        loop {
            match tokio::try_join!(self.adapter.list_symbols(), self.adapter.list_tickers_24h()) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    PipelineCounters::incr(&self.counters.transport_errors);
                    warn!(exchange = %self.name, error = %e, "discovery failed — retrying");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = self.token.cancelled() => return Ok((Vec::new(), Vec::new())),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn forward(&self, event: MarketEvent) {
        if self.event_tx.try_send(event).is_err() {
            PipelineCounters::incr(&self.counters.backpressure_drops);
        }
    }
}

// ---------------------------------------------------------------------------
// Symbol filtering
// ---------------------------------------------------------------------------

/// Join discovery with 24 h tickers and apply the configured filters.
///
/// A symbol survives when its 24 h quote volume lies inside the inclusive
/// `[min, max]` band, it is not excluded by exact normalized name, and it is
/// not listed on the designated major exchange (when that filter is active).
pub fn filter_symbols(
    infos: &[SymbolInfo],
    tickers: &HashMap<String, TickerStats>,
    cfg: &ExchangeConfig,
    major_listings: Option<&HashSet<String>>,
) -> Vec<String> {
    let mut out: Vec<String> = infos
        .iter()
        .filter_map(|info| {
            let stats = tickers.get(&info.symbol)?;
            let volume = stats.quote_volume_24h;
            if volume < cfg.min_quote_volume_24h || volume > cfg.max_quote_volume_24h {
                return None;
            }
            if cfg.exclude_symbols.iter().any(|s| s == &info.symbol) {
                return None;
            }
            if major_listings.is_some_and(|m| m.contains(&info.symbol)) {
                return None;
            }
            Some(info.symbol.clone())
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn info(symbol: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            price_step: dec!(0.01),
            qty_step: dec!(0.001),
            min_notional: dec!(5),
        }
    }

    fn stats(volume: Decimal) -> TickerStats {
        TickerStats {
            quote_volume_24h: volume,
            price_change_pct_24h: dec!(0),
            last_price: dec!(1),
            best_bid: None,
            best_ask: None,
        }
    }

    fn band(min: Decimal, max: Decimal) -> ExchangeConfig {
        ExchangeConfig {
            min_quote_volume_24h: min,
            max_quote_volume_24h: max,
            exclude_symbols: Vec::new(),
            exclude_if_listed_on: None,
        }
    }

    #[test]
    fn volume_band_is_inclusive() {
        let infos = vec![info("AAA_USDT"), info("BBB_USDT"), info("CCC_USDT")];
        let tickers: HashMap<String, TickerStats> = [
            ("AAA_USDT".to_string(), stats(dec!(100))),
            ("BBB_USDT".to_string(), stats(dec!(500))),
            ("CCC_USDT".to_string(), stats(dec!(501))),
        ]
        .into();
        let selected = filter_symbols(&infos, &tickers, &band(dec!(100), dec!(500)), None);
        assert_eq!(selected, vec!["AAA_USDT", "BBB_USDT"]);
    }

    #[test]
    fn symbols_without_ticker_are_dropped() {
        let infos = vec![info("AAA_USDT"), info("NOTICKER_USDT")];
        let tickers: HashMap<String, TickerStats> =
            [("AAA_USDT".to_string(), stats(dec!(100)))].into();
        let selected = filter_symbols(&infos, &tickers, &band(dec!(1), dec!(1000)), None);
        assert_eq!(selected, vec!["AAA_USDT"]);
    }

    #[test]
    fn exclusion_list_matches_exact_names() {
        let infos = vec![info("AAA_USDT"), info("BBB_USDT")];
        let tickers: HashMap<String, TickerStats> = [
            ("AAA_USDT".to_string(), stats(dec!(100))),
            ("BBB_USDT".to_string(), stats(dec!(100))),
        ]
        .into();
        let mut cfg = band(dec!(1), dec!(1000));
        cfg.exclude_symbols = vec!["BBB_USDT".to_string()];
        let selected = filter_symbols(&infos, &tickers, &cfg, None);
        assert_eq!(selected, vec!["AAA_USDT"]);
    }

    #[test]
    fn major_exchange_listings_are_excluded() {
        let infos = vec![info("AAA_USDT"), info("BBB_USDT")];
        let tickers: HashMap<String, TickerStats> = [
            ("AAA_USDT".to_string(), stats(dec!(100))),
            ("BBB_USDT".to_string(), stats(dec!(100))),
        ]
        .into();
        let major: HashSet<String> = ["AAA_USDT".to_string()].into();
        let selected = filter_symbols(&infos, &tickers, &band(dec!(1), dec!(1000)), Some(&major));
        assert_eq!(selected, vec!["BBB_USDT"]);
    }
}

// =============================================================================
// Aggregation & broadcast worker — the 200 ms heartbeat of the outbound feed
// =============================================================================
//
// Two cadences share one loop: every tick drains the per-symbol staging and
// emits one OHLCV aggregate per active symbol; every `metadata_every_n_ticks`
// ticks the latest ranked snapshot is fanned out as `all_symbols_scored` +
// `top_N_update`. Deviation batches are forwarded as they arrive, with the
// optional signal overlay applied inline.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::analytics::{DeviationRecord, RankedSnapshot, SignalDetector, SignalEvent};
use crate::broadcast::hub::BroadcastHub;
use crate::broadcast::messages::{aggregate_trades, DeviationEntry, OutboundMessage};
use crate::market_data::{now_ms, WindowStore};
use crate::runtime_config::{BroadcastSection, SignalsSection};

pub struct BroadcastWorker {
    store: Arc<WindowStore>,
    hub: Arc<BroadcastHub>,
    snapshot_rx: watch::Receiver<RankedSnapshot>,
    deviation_rx: mpsc::Receiver<Vec<DeviationRecord>>,
    config: BroadcastSection,
    signals: SignalsSection,
    detector: Option<SignalDetector>,
}

impl BroadcastWorker {
    pub fn new(
        store: Arc<WindowStore>,
        hub: Arc<BroadcastHub>,
        snapshot_rx: watch::Receiver<RankedSnapshot>,
        deviation_rx: mpsc::Receiver<Vec<DeviationRecord>>,
        config: BroadcastSection,
        signals: SignalsSection,
    ) -> Self {
        let detector = signals.enabled.then(|| SignalDetector::new(signals.clone()));
        Self {
            store,
            hub,
            snapshot_rx,
            deviation_rx,
            config,
            signals,
            detector,
        }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.aggregate_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick_count: u32 = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,

                _ = ticker.tick() => {
                    self.emit_aggregates();
                    tick_count = tick_count.wrapping_add(1);
                    if tick_count % self.config.metadata_every_n_ticks == 0 {
                        self.emit_metadata();
                    }
                }

                batch = self.deviation_rx.recv() => {
                    match batch {
                        Some(records) => self.emit_deviations(records),
                        None => return,
                    }
                }
            }
        }
    }

    /// Drain staged trades and emit one aggregate per active symbol. Trades
    /// are staged in arrival order, so per-symbol bucket timestamps never go
    /// backwards.
    fn emit_aggregates(&self) {
        let drained = self.store.drain_pending();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        for (key, trades) in drained {
            if let Some(bucket) = aggregate_trades(&trades) {
                self.hub.broadcast(OutboundMessage::TradeAggregate {
                    symbol: key.to_string(),
                    aggregate: bucket,
                });
            }
        }
        debug!(symbols = count, "trade aggregates emitted");
    }

    /// Fan out the latest ranked snapshot from the metrics engine.
    fn emit_metadata(&mut self) {
        let snapshot = self.snapshot_rx.borrow_and_update().clone();
        if snapshot.entries.is_empty() {
            return;
        }

        let ranking: Vec<String> = snapshot
            .entries
            .iter()
            .map(|e| e.symbol.clone())
            .collect();
        let top_n: Vec<String> = ranking.iter().take(self.config.top_n).cloned().collect();
        self.hub.update_ranking(ranking);

        let total = snapshot.entries.len();
        self.hub.broadcast(OutboundMessage::AllSymbolsScored {
            timestamp_ms: snapshot.timestamp_ms,
            total,
            symbols: snapshot.entries,
        });
        self.hub.broadcast(OutboundMessage::TopNUpdate {
            timestamp_ms: snapshot.timestamp_ms,
            symbols: top_n,
        });
    }

    /// Forward one sweep's records, then run the signal overlay if enabled.
    fn emit_deviations(&mut self, records: Vec<DeviationRecord>) {
        let now = now_ms();
        let entries: Vec<DeviationEntry> = records
            .iter()
            .map(|r| deviation_entry(r, &self.signals))
            .collect();
        self.hub.broadcast(OutboundMessage::DeviationUpdate {
            timestamp_ms: now,
            count: entries.len(),
            deviations: entries,
        });

        if let Some(detector) = self.detector.as_mut() {
            for record in &records {
                match detector.observe(record, now) {
                    Some(SignalEvent::Entry(signal)) => {
                        self.hub.broadcast(OutboundMessage::EntrySignal { signal });
                    }
                    Some(SignalEvent::Exit(signal)) => {
                        self.hub.broadcast(OutboundMessage::ExitSignal { signal });
                    }
                    None => {}
                }
            }
        }
    }
}

/// Client-facing shape of one deviation record. The significance flags reuse
/// the signal thresholds so the UI can color rows without its own policy.
fn deviation_entry(record: &DeviationRecord, signals: &SignalsSection) -> DeviationEntry {
    let dev = record.dev_pct.abs();
    DeviationEntry {
        symbol: record.symbol.clone(),
        exchange_cheap: record.exchange_cheap.clone(),
        exchange_expensive: record.exchange_expensive.clone(),
        price_cheap: record.bid_cheap,
        price_expensive: record.bid_expensive,
        deviation_pct: record.dev_pct,
        is_significant: dev >= signals.entry_threshold_pct,
        is_near_parity: dev <= signals.exit_threshold_pct,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

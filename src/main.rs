// =============================================================================
// Pulse Screener — Main Entry Point
// =============================================================================
//
// Wires the full pipeline and runs until Ctrl+C. Only an invalid config or a
// failed port bind exits non-zero; every runtime failure is recovered inside
// the component that observed it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pulse_screener::analytics::{
    deviation::run_deviation_worker, metrics::run_metrics_worker, DeviationEngine, MetricsEngine,
    RankedSnapshot,
};
use pulse_screener::api;
use pulse_screener::app_state::AppState;
use pulse_screener::broadcast::{BroadcastHub, BroadcastWorker, DEFAULT_QUEUE_CAPACITY};
use pulse_screener::errors::PipelineCounters;
use pulse_screener::exchanges::{BinanceAdapter, BybitAdapter, ExchangeAdapter};
use pulse_screener::market_data::{now_ms, MarketEvent, WindowConfig, WindowStore};
use pulse_screener::orchestrator::Orchestrator;
use pulse_screener::runtime_config::RuntimeConfig;

/// Bounded ingestion channel between the adapters and the store consumer.
const INGEST_CHANNEL_CAPACITY: usize = 100_000;

/// Workers get this long to exit after cancellation before teardown is forced.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Pulse Screener starting up");

    let config_path =
        std::env::var("PULSE_CONFIG").unwrap_or_else(|_| "screener_config.json".into());
    let mut config = if std::path::Path::new(&config_path).exists() {
        // An unreadable or invalid config file is fatal by design.
        RuntimeConfig::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found — using defaults");
        RuntimeConfig::default()
    };

    if let Ok(addr) = std::env::var("PULSE_BIND_ADDR") {
        config.server.stream_listen = addr;
    }
    config.validate()?;

    info!(
        exchanges = ?config.exchanges.keys().collect::<Vec<_>>(),
        listen = %config.server.stream_listen,
        "configuration ready"
    );

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let token = CancellationToken::new();
    let counters = Arc::new(PipelineCounters::default());
    let store = Arc::new(WindowStore::new(
        WindowConfig {
            window_ms: config.window.duration_ms,
            trades_per_symbol_cap: config.window.trades_per_symbol_cap,
            symbol_cap: config.window.symbol_cap,
            ..WindowConfig::default()
        },
        counters.clone(),
    ));
    let hub = Arc::new(BroadcastHub::new(counters.clone(), DEFAULT_QUEUE_CAPACITY));

    let mut workers = Vec::new();

    // ── 3. Ingestion: adapters → orchestrator → store consumer ──────────
    let (event_tx, mut event_rx) = mpsc::channel::<MarketEvent>(INGEST_CHANNEL_CAPACITY);

    let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::new();
    for name in config.exchanges.keys() {
        match name.as_str() {
            "binance" => adapters.push(Arc::new(BinanceAdapter::new(
                config.streams.clone(),
                counters.clone(),
            ))),
            "bybit" => adapters.push(Arc::new(BybitAdapter::new(
                config.streams.clone(),
                counters.clone(),
            ))),
            other => warn!(exchange = %other, "no adapter available — exchange skipped"),
        }
    }

    let orchestrator = Arc::new(Orchestrator::new(
        adapters,
        config.exchanges.clone().into_iter().collect(),
        event_tx.clone(),
        counters.clone(),
        token.clone(),
    ));
    workers.extend(orchestrator.start());
    drop(event_tx); // consumers detect shutdown once all senders are gone

    {
        let store = store.clone();
        let stop = token.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    event = event_rx.recv() => match event {
                        Some(event) => store.apply(event, now_ms()),
                        None => return,
                    }
                }
            }
        }));
    }

    // ── 4. Metrics engine (ranking tick) ─────────────────────────────────
    let (snapshot_tx, snapshot_rx) = watch::channel(RankedSnapshot::default());
    {
        let engine = MetricsEngine::new(store.clone(), config.broadcast.detail_top_k);
        let stop = token.clone();
        workers.push(tokio::spawn(run_metrics_worker(
            engine,
            snapshot_tx,
            Duration::from_secs(2),
            stop,
        )));
    }

    // ── 5. Deviation sweep ───────────────────────────────────────────────
    let (deviation_tx, deviation_rx) = mpsc::channel(64);
    {
        let engine = DeviationEngine::new(store.clone(), config.deviation.min_threshold_pct);
        let interval = Duration::from_millis(config.deviation.sweep_interval_ms);
        let stop = token.clone();
        workers.push(tokio::spawn(run_deviation_worker(
            engine,
            deviation_tx,
            interval,
            stop,
        )));
    }

    // ── 6. Aggregation & broadcast ───────────────────────────────────────
    {
        let worker = BroadcastWorker::new(
            store.clone(),
            hub.clone(),
            snapshot_rx,
            deviation_rx,
            config.broadcast.clone(),
            config.signals.clone(),
        );
        let stop = token.clone();
        workers.push(tokio::spawn(worker.run(stop)));
    }

    // ── 7. HTTP / WebSocket server ───────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        hub,
        counters,
        orchestrator,
    ));
    let listener = tokio::net::TcpListener::bind(&config.server.stream_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.stream_listen))?;
    info!(addr = %config.server.stream_listen, "server listening");

    let server = {
        let app = api::rest::router(state);
        let stop = token.clone();
        tokio::spawn(async move {
            let shutdown = async move { stop.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "server failed");
            }
        })
    };
    workers.push(server);

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    token.cancel();

    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("grace period expired — forcing teardown");
    }

    if let Err(e) = config.save(&config_path) {
        warn!(error = %e, "failed to persist config on shutdown");
    }

    info!("Pulse Screener shut down complete");
    Ok(())
}

// =============================================================================
// Central application state
// =============================================================================
//
// The handle shared by every async task via `Arc<AppState>`. Subsystems own
// their internals; AppState ties them together and builds the observability
// snapshot for the HTTP surface.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::broadcast::BroadcastHub;
use crate::errors::{CounterSnapshot, PipelineCounters};
use crate::market_data::WindowStore;
use crate::orchestrator::{ExchangeStatusReport, Orchestrator};
use crate::runtime_config::RuntimeConfig;

pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<WindowStore>,
    pub hub: Arc<BroadcastHub>,
    pub counters: Arc<PipelineCounters>,
    pub orchestrator: Arc<Orchestrator>,
    pub start_time: std::time::Instant,
}

/// Payload of `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub server_time: i64,
    pub uptime_s: u64,
    pub active_symbols: usize,
    pub client_sessions: usize,
    pub exchanges: Vec<ExchangeStatusReport>,
    pub counters: CounterSnapshot,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<WindowStore>,
        hub: Arc<BroadcastHub>,
        counters: Arc<PipelineCounters>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            config,
            store,
            hub,
            counters,
            orchestrator,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            active_symbols: self.store.len(),
            client_sessions: self.hub.session_count(),
            exchanges: self.orchestrator.status_reports(),
            counters: self.counters.snapshot(),
        }
    }
}

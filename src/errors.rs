// =============================================================================
// Error taxonomy + pipeline counters
// =============================================================================
//
// Every runtime error is recovered inside the component that observed it; the
// counters below are the only trace most of them leave. Only `Config` (and a
// failed port bind in main) terminates the process.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

/// Classified failure kinds across the screener pipeline.
#[derive(Debug, Error)]
pub enum ScreenerError {
    /// Event with a non-positive price/quantity or an unknown side token.
    /// Dropped by the adapter that produced it.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Connection-level failure on an exchange socket. Triggers reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// REST request failure. Retried under the adapter's backoff policy.
    #[error("rest error: {0}")]
    Rest(#[from] reqwest::Error),

    /// Unrecognized or inconsistent wire message. The offending message is
    /// dropped without tearing the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Startup-time configuration failure. Fatal.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Store invariant violation. The offending write is rejected; the
    /// buffer remains valid.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

// =============================================================================
// Pipeline counters
// =============================================================================

/// Lock-free drop/error accounting, surfaced via `GET /api/v1/status`.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub malformed_events: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub transport_errors: AtomicU64,
    pub backpressure_drops: AtomicU64,
    pub client_overflows: AtomicU64,
    pub integrity_rejects: AtomicU64,
    pub skewed_timestamps: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`] for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub malformed_events: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
    pub backpressure_drops: u64,
    pub client_overflows: u64,
    pub integrity_rejects: u64,
    pub skewed_timestamps: u64,
}

impl PipelineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            client_overflows: self.client_overflows.load(Ordering::Relaxed),
            integrity_rejects: self.integrity_rejects.load(Ordering::Relaxed),
            skewed_timestamps: self.skewed_timestamps.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Pulse Screener — real-time cross-exchange market activity screener
// =============================================================================
//
// Pipeline: exchange adapters → ingestion orchestrator → rolling-window
// store → metrics / deviation engines → aggregation & broadcast → client
// sessions.
// =============================================================================

pub mod analytics;
pub mod api;
pub mod app_state;
pub mod broadcast;
pub mod errors;
pub mod exchanges;
pub mod market_data;
pub mod orchestrator;
pub mod runtime_config;
pub mod types;

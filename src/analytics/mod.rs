// =============================================================================
// Analytics — derived views over the rolling-window store
// =============================================================================
//
// - Metrics: windowed activity scores and symbol ranking (2 s cadence).
// - Deviation: cross-exchange bid alignment and threshold sweeps (100 ms).
// - Signals: optional entry/exit overlay on top of the deviation stream.

pub mod deviation;
pub mod metrics;
pub mod signals;

pub use deviation::{DeviationEngine, DeviationRecord};
pub use metrics::{MetricsEngine, RankedEntry, RankedSnapshot};
pub use signals::{SignalDetector, SignalEvent, SignalRecord};

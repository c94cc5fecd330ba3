// =============================================================================
// Runtime Configuration — screener settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ScreenerError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_min_quote_volume() -> Decimal {
    dec!(200000)
}

fn default_max_quote_volume() -> Decimal {
    dec!(100000000)
}

fn default_window_duration_ms() -> i64 {
    30 * 60 * 1000
}

fn default_trades_per_symbol_cap() -> usize {
    5_000
}

fn default_symbol_cap() -> usize {
    5_000
}

fn default_aggregate_interval_ms() -> u64 {
    200
}

fn default_metadata_every_n_ticks() -> u32 {
    10
}

fn default_top_n() -> usize {
    70
}

fn default_detail_top_k() -> usize {
    500
}

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_min_threshold_pct() -> Decimal {
    dec!(0.10)
}

fn default_entry_threshold_pct() -> Decimal {
    dec!(0.35)
}

fn default_exit_threshold_pct() -> Decimal {
    dec!(0.05)
}

fn default_signal_cooldown_ms() -> i64 {
    10_000
}

fn default_signal_expiry_ms() -> i64 {
    5 * 60 * 1000
}

fn default_stream_listen() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_exchanges() -> BTreeMap<String, ExchangeConfig> {
    let mut map = BTreeMap::new();
    map.insert("binance".to_string(), ExchangeConfig::default());
    map.insert("bybit".to_string(), ExchangeConfig::default());
    map
}

// =============================================================================
// Sections
// =============================================================================

/// Per-exchange symbol discovery filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Inclusive lower bound on 24 h quote volume.
    #[serde(default = "default_min_quote_volume")]
    pub min_quote_volume_24h: Decimal,

    /// Inclusive upper bound on 24 h quote volume.
    #[serde(default = "default_max_quote_volume")]
    pub max_quote_volume_24h: Decimal,

    /// Symbols (normalized names) excluded from subscription.
    #[serde(default)]
    pub exclude_symbols: Vec<String>,

    /// Drop any symbol that is also listed on this exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_if_listed_on: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            min_quote_volume_24h: default_min_quote_volume(),
            max_quote_volume_24h: default_max_quote_volume(),
            exclude_symbols: Vec::new(),
            exclude_if_listed_on: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_true")]
    pub enable_trades: bool,
    #[serde(default = "default_true")]
    pub enable_quotes: bool,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            enable_trades: true,
            enable_quotes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSection {
    #[serde(default = "default_window_duration_ms")]
    pub duration_ms: i64,
    #[serde(default = "default_trades_per_symbol_cap")]
    pub trades_per_symbol_cap: usize,
    #[serde(default = "default_symbol_cap")]
    pub symbol_cap: usize,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            duration_ms: default_window_duration_ms(),
            trades_per_symbol_cap: default_trades_per_symbol_cap(),
            symbol_cap: default_symbol_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSection {
    #[serde(default = "default_aggregate_interval_ms")]
    pub aggregate_interval_ms: u64,
    #[serde(default = "default_metadata_every_n_ticks")]
    pub metadata_every_n_ticks: u32,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_detail_top_k")]
    pub detail_top_k: usize,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            aggregate_interval_ms: default_aggregate_interval_ms(),
            metadata_every_n_ticks: default_metadata_every_n_ticks(),
            top_n: default_top_n(),
            detail_top_k: default_detail_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviationSection {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_min_threshold_pct")]
    pub min_threshold_pct: Decimal,
}

impl Default for DeviationSection {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            min_threshold_pct: default_min_threshold_pct(),
        }
    }
}

/// Optional entry/exit signal overlay on top of the deviation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_entry_threshold_pct")]
    pub entry_threshold_pct: Decimal,
    #[serde(default = "default_exit_threshold_pct")]
    pub exit_threshold_pct: Decimal,
    #[serde(default = "default_signal_cooldown_ms")]
    pub cooldown_ms: i64,
    #[serde(default = "default_signal_expiry_ms")]
    pub expiry_ms: i64,
}

impl Default for SignalsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            entry_threshold_pct: default_entry_threshold_pct(),
            exit_threshold_pct: default_exit_threshold_pct(),
            cooldown_ms: default_signal_cooldown_ms(),
            expiry_ms: default_signal_expiry_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Duplex message channel endpoint (host:port).
    #[serde(default = "default_stream_listen")]
    pub stream_listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            stream_listen: default_stream_listen(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the screener.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_exchanges")]
    pub exchanges: BTreeMap<String, ExchangeConfig>,

    #[serde(default)]
    pub streams: StreamsConfig,

    #[serde(default)]
    pub window: WindowSection,

    #[serde(default)]
    pub broadcast: BroadcastSection,

    #[serde(default)]
    pub deviation: DeviationSection,

    #[serde(default)]
    pub signals: SignalsSection,

    #[serde(default)]
    pub server: ServerSection,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchanges: default_exchanges(),
            streams: StreamsConfig::default(),
            window: WindowSection::default(),
            broadcast: BroadcastSection::default(),
            deviation: DeviationSection::default(),
            signals: SignalsSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate().map_err(anyhow::Error::from)?;

        info!(
            path = %path.display(),
            exchanges = ?config.exchanges.keys().collect::<Vec<_>>(),
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Startup-time sanity checks. A failure here is fatal.
    pub fn validate(&self) -> Result<(), ScreenerError> {
        for (name, ex) in &self.exchanges {
            if ex.min_quote_volume_24h > ex.max_quote_volume_24h {
                return Err(ScreenerError::Config(format!(
                    "exchange {name}: min_quote_volume_24h > max_quote_volume_24h"
                )));
            }
        }
        if self.window.duration_ms <= 0 {
            return Err(ScreenerError::Config("window.duration_ms must be > 0".into()));
        }
        if self.window.trades_per_symbol_cap == 0 || self.window.symbol_cap == 0 {
            return Err(ScreenerError::Config("window caps must be > 0".into()));
        }
        if self.broadcast.aggregate_interval_ms == 0 || self.broadcast.metadata_every_n_ticks == 0 {
            return Err(ScreenerError::Config("broadcast intervals must be > 0".into()));
        }
        if self.deviation.min_threshold_pct < Decimal::ZERO {
            return Err(ScreenerError::Config(
                "deviation.min_threshold_pct must be >= 0".into(),
            ));
        }
        self.server
            .stream_listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                ScreenerError::Config(format!(
                    "server.stream_listen {:?} is not host:port: {e}",
                    self.server.stream_listen
                ))
            })?;
        Ok(())
    }
}

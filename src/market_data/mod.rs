pub mod events;
pub mod window_store;

// Re-export the event vocabulary for convenient access
// (e.g. `use crate::market_data::MarketEvent`).
pub use events::{
    normalize_symbol, now_ms, MarketEvent, QuoteTick, SymbolInfo, SymbolKey, TickerStats,
    TradeTick,
};
pub use window_store::{SymbolState, WindowConfig, WindowStore};

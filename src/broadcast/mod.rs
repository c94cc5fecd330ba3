pub mod aggregator;
pub mod hub;
pub mod messages;

pub use aggregator::BroadcastWorker;
pub use hub::{BroadcastHub, ClientSession, PageSelection, DEFAULT_QUEUE_CAPACITY};
pub use messages::{aggregate_trades, InboundMessage, OhlcvBucket, OutboundMessage};

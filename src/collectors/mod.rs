//! Data collection: WebSocket streams, OHLCV aggregation, catalog diffing,
//! notice polling and the optional hot-wallet probe.

pub mod aggregator;
pub mod bithumb;
pub mod hot_wallet;
pub mod listing_monitor;
pub mod notice;
pub mod robust_ws;
pub mod second_bucket;
pub mod upbit;

pub use aggregator::Aggregator;
pub use bithumb::BithumbCollector;
pub use listing_monitor::{BithumbCatalog, ListingMonitor, UpbitCatalog};
pub use robust_ws::CollectorHandle;
pub use second_bucket::SecondBucket;
pub use upbit::UpbitCollector;

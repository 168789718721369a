pub mod aggregator;
pub mod ohlc_cache;
pub mod price_stream;

pub use aggregator::MarketDataAggregator;
pub use ohlc_cache::OhlcCache;
pub use price_stream::{ConnState, PriceStream};

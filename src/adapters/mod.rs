pub mod feed;

pub use feed::{MarketDataFeed, ReplayFeed};

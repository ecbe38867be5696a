// Layer 1 - Data Connectors
// Exchange REST history, continuous-kline stream, DEX price polling

pub mod rest_client;
pub mod websocket;
pub mod dex_feed;

// Re-export commonly used items for convenience
pub use rest_client::{KlineRestClient, RateLimiter, RestClientError, RestClientStats};
pub use websocket::{KlineStream, KlineStreamStats, StreamError, StreamState};
pub use dex_feed::{aggregate_pairs, DexFeed, DexFeedError, DexFeedStats, DexPair, DexResponse, DexSnapshot};

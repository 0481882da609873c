pub mod candles;
pub mod indicators;
pub mod pipeline;

pub use pipeline::{MarketPipeline, MarketSnapshot};

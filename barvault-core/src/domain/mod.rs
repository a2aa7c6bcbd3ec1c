//! Domain types for barvault

pub mod bar;
pub mod market;
pub mod timeframe;

pub use bar::{BarKey, MinuteBar};
pub use market::{Asset, MarketClock, TradingDay};
pub use timeframe::{Timeframe, TimeframeError};

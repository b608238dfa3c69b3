//! Performance reporting over the transaction log.

mod calculator;

pub use calculator::TradeStats;

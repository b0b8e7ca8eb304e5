//! Historical data providers

pub mod binance;
pub mod json_dir;

pub use binance::BinanceClient;
pub use json_dir::JsonDirProvider;

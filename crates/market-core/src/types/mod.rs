//! 시세 데이터 타입 정의.

pub mod kline;
pub mod timeframe;

pub use kline::*;
pub use timeframe::*;

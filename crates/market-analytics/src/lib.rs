//! # Market Analytics
//!
//! 캔들 시계열에서 기술적 지표를 계산합니다.
//!
//! - [`BufferPool`]: 길이별 재사용 버퍼로 재계산 경로의 할당을 없앱니다.
//! - [`IndicatorEngine`]: SMA, EMA, RSI, 볼린저 밴드.
//! - [`IndicatorWorker`]: 엔진과 풀을 소유하는 전용 스레드.

pub mod buffer_pool;
pub mod indicators;
pub mod worker;

pub use buffer_pool::{BufferMisuseError, BufferPool, PoolStats, PooledBuffer};
pub use indicators::{
    BollingerBands, BollingerBandsParams, IndicatorEngine, IndicatorError, IndicatorResult,
};
pub use worker::{
    compute_indicators, IndicatorKind, IndicatorOutput, IndicatorRequest, IndicatorSettings,
    IndicatorWorker,
};

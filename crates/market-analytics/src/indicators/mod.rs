//! 기술적 지표 모듈.
//!
//! # 지원 지표
//!
//! ## 추세 지표
//! - **SMA**: 단순 이동평균
//! - **EMA**: 지수 이동평균
//!
//! ## 모멘텀 지표
//! - **RSI**: 상대강도지수
//!
//! ## 변동성 지표
//! - **Bollinger Bands**: 볼린저 밴드
//!
//! 모든 출력은 입력과 같은 길이이며, 값을 계산할 수 없는 워밍업 구간은 NaN입니다.
//! 데이터가 기간보다 짧은 것은 에러가 아니라 전부 NaN인 정상 출력입니다.
//!
//! # 사용 예시
//!
//! ```
//! use market_analytics::IndicatorEngine;
//!
//! let mut engine = IndicatorEngine::new();
//! let closes = [100.0, 102.0, 98.0, 101.0, 99.0];
//!
//! let sma = engine.simple_moving_average(&closes, 3, None).unwrap();
//! assert_eq!(sma[2], 100.0);
//! engine.release(sma).unwrap();
//! ```

pub mod momentum;
pub mod trend;
pub mod volatility;

use thiserror::Error;

use crate::buffer_pool::{BufferMisuseError, BufferPool, PooledBuffer};

pub use momentum::rsi_into;
pub use trend::{ema_into, sma_into};
pub use volatility::{bandwidth_into, bollinger_into, percent_b_into, BollingerBandsParams};

/// 지표 계산 오류.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    /// 잘못된 파라미터
    #[error("잘못된 파라미터: {0}")]
    InvalidParameter(String),

    /// 빈 입력
    #[error("입력 데이터가 비어 있습니다")]
    EmptyInput,

    /// 출력 버퍼 길이가 입력과 다름
    #[error("출력 길이 불일치: 필요 {expected}, 제공 {actual}")]
    OutputLength { expected: usize, actual: usize },

    /// 버퍼 오사용
    #[error(transparent)]
    Buffer(#[from] BufferMisuseError),

    /// 워커 스레드에 접근할 수 없음
    #[error("지표 워커를 사용할 수 없습니다: {0}")]
    WorkerUnavailable(String),
}

impl IndicatorError {
    /// 프로그래밍 오류(재시도해도 결과가 같은 에러)인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IndicatorError::WorkerUnavailable(_))
    }
}

/// 지표 계산 결과 타입.
pub type IndicatorResult<T> = Result<T, IndicatorError>;

pub(crate) fn check_period(data: &[f64], period: usize) -> IndicatorResult<()> {
    if period == 0 {
        return Err(IndicatorError::InvalidParameter(
            "기간은 0보다 커야 합니다".to_string(),
        ));
    }
    if data.is_empty() {
        return Err(IndicatorError::EmptyInput);
    }
    Ok(())
}

pub(crate) fn check_output(expected: usize, actual: usize) -> IndicatorResult<()> {
    if expected != actual {
        return Err(IndicatorError::OutputLength { expected, actual });
    }
    Ok(())
}

/// 볼린저 밴드 결과 (풀 버퍼 세 개).
#[derive(Debug)]
pub struct BollingerBands {
    /// 중간 밴드 (SMA)
    pub middle: PooledBuffer,
    /// 상단 밴드
    pub upper: PooledBuffer,
    /// 하단 밴드
    pub lower: PooledBuffer,
}

/// 통합 지표 엔진.
///
/// 출력 버퍼를 자체 [`BufferPool`]에서 대여합니다. 호출자가 넘긴 버퍼는
/// 길이가 맞으면 그대로 재사용하고, 맞지 않으면 풀에 돌려준 뒤 새로 대여합니다.
/// 계산 결과는 입력에만 의존하며 호출 간 공유되는 상태는 풀뿐입니다.
#[derive(Debug, Default)]
pub struct IndicatorEngine {
    pool: BufferPool,
}

impl IndicatorEngine {
    /// 새로운 지표 엔진 생성.
    pub fn new() -> Self {
        Self::default()
    }

    /// 주어진 풀을 사용하는 엔진 생성.
    pub fn with_pool(pool: BufferPool) -> Self {
        Self { pool }
    }

    /// 내부 풀 참조.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// 결과 버퍼를 풀에 반납합니다.
    pub fn release(&mut self, buffer: PooledBuffer) -> Result<(), BufferMisuseError> {
        self.pool.release(buffer)
    }

    /// 볼린저 밴드 버퍼 세 개를 반납합니다.
    pub fn release_bands(&mut self, bands: BollingerBands) -> Result<(), BufferMisuseError> {
        self.pool.release(bands.middle)?;
        self.pool.release(bands.upper)?;
        self.pool.release(bands.lower)
    }

    /// 실패한 계산의 버퍼를 풀에 돌려줍니다. 다른 풀의 버퍼는 무시됩니다.
    fn discard(&mut self, buffers: impl IntoIterator<Item = PooledBuffer>) {
        for buf in buffers {
            let _ = self.pool.release(buf);
        }
    }

    fn compute_single(
        &mut self,
        data: &[f64],
        period: usize,
        out: Option<PooledBuffer>,
        kernel: fn(&[f64], usize, &mut [f64]) -> IndicatorResult<()>,
    ) -> IndicatorResult<PooledBuffer> {
        if let Err(e) = check_period(data, period) {
            self.discard(out);
            return Err(e);
        }
        let mut buf = self.output_buffer(data.len(), out)?;
        if let Err(e) = kernel(data, period, &mut buf) {
            self.discard([buf]);
            return Err(e);
        }
        Ok(buf)
    }

    fn output_buffer(
        &mut self,
        len: usize,
        out: Option<PooledBuffer>,
    ) -> IndicatorResult<PooledBuffer> {
        match out {
            Some(buf) if buf.len() == len && self.pool.owns(&buf) => Ok(buf),
            // 소유하지 않은 버퍼는 여기서 BufferMisuseError로 거부된다
            Some(buf) => {
                self.pool.release(buf)?;
                Ok(self.pool.acquire(len))
            }
            None => Ok(self.pool.acquire(len)),
        }
    }

    // ==================== 추세 지표 ====================

    /// 단순 이동평균 (SMA) 계산.
    ///
    /// # 인자
    /// * `data` - 가격 데이터 (종가)
    /// * `period` - 기간 (1 이상)
    /// * `out` - 재사용할 출력 버퍼 (선택)
    pub fn simple_moving_average(
        &mut self,
        data: &[f64],
        period: usize,
        out: Option<PooledBuffer>,
    ) -> IndicatorResult<PooledBuffer> {
        self.compute_single(data, period, out, sma_into)
    }

    /// 지수 이동평균 (EMA) 계산.
    pub fn exponential_moving_average(
        &mut self,
        data: &[f64],
        period: usize,
        out: Option<PooledBuffer>,
    ) -> IndicatorResult<PooledBuffer> {
        self.compute_single(data, period, out, ema_into)
    }

    // ==================== 모멘텀 지표 ====================

    /// RSI 계산. 0~100 범위.
    pub fn relative_strength_index(
        &mut self,
        data: &[f64],
        period: usize,
        out: Option<PooledBuffer>,
    ) -> IndicatorResult<PooledBuffer> {
        self.compute_single(data, period, out, rsi_into)
    }

    // ==================== 변동성 지표 ====================

    /// 볼린저 밴드 계산.
    ///
    /// 중간 밴드를 먼저 구한 뒤, 인덱스마다 창을 다시 순회해 분산을 계산합니다.
    /// 표준편차 = sqrt(Σ(x - mean)² / period), 밴드 = mean ± 표준편차 × 배수.
    pub fn bollinger_bands(
        &mut self,
        data: &[f64],
        params: BollingerBandsParams,
        out: Option<BollingerBands>,
    ) -> IndicatorResult<BollingerBands> {
        let checked = check_period(data, params.period).and_then(|()| params.validate());
        let (middle, upper, lower) = match out {
            Some(b) => (Some(b.middle), Some(b.upper), Some(b.lower)),
            None => (None, None, None),
        };
        if let Err(e) = checked {
            self.discard(middle.into_iter().chain(upper).chain(lower));
            return Err(e);
        }

        let n = data.len();
        let middle = match self.output_buffer(n, middle) {
            Ok(buf) => buf,
            Err(e) => {
                self.discard(upper.into_iter().chain(lower));
                return Err(e);
            }
        };
        let upper = match self.output_buffer(n, upper) {
            Ok(buf) => buf,
            Err(e) => {
                self.discard(std::iter::once(middle).chain(lower));
                return Err(e);
            }
        };
        let lower = match self.output_buffer(n, lower) {
            Ok(buf) => buf,
            Err(e) => {
                self.discard([middle, upper]);
                return Err(e);
            }
        };
        let mut bands = BollingerBands {
            middle,
            upper,
            lower,
        };

        if let Err(e) = bollinger_into(
            data,
            params,
            &mut bands.middle,
            &mut bands.upper,
            &mut bands.lower,
        ) {
            self.discard([bands.middle, bands.upper, bands.lower]);
            return Err(e);
        }
        Ok(bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closes() -> Vec<f64> {
        vec![100.0, 102.0, 98.0, 101.0, 99.0]
    }

    #[test]
    fn test_engine_sma_scenario() {
        let mut engine = IndicatorEngine::new();
        let sma = engine.simple_moving_average(&closes(), 3, None).unwrap();

        assert_eq!(sma.len(), 5);
        assert!(sma[0].is_nan() && sma[1].is_nan());
        assert!((sma[2] - 100.0).abs() < 1e-12);
        assert!((sma[4] - 298.0 / 3.0).abs() < 1e-12);
        engine.release(sma).unwrap();
        assert_eq!(engine.pool().stats().outstanding, 0);
    }

    #[test]
    fn test_engine_reuses_matching_buffer() {
        let mut engine = IndicatorEngine::new();
        let first = engine.simple_moving_average(&closes(), 2, None).unwrap();
        let serial = first.serial();

        let second = engine
            .simple_moving_average(&closes(), 3, Some(first))
            .unwrap();
        assert_eq!(second.serial(), serial);
        assert_eq!(engine.pool().stats().allocations, 1);
    }

    #[test]
    fn test_engine_replaces_mismatched_buffer() {
        let mut engine = IndicatorEngine::new();
        let wrong = engine.simple_moving_average(&[1.0, 2.0], 1, None).unwrap();

        let sma = engine
            .simple_moving_average(&closes(), 3, Some(wrong))
            .unwrap();
        assert_eq!(sma.len(), 5);
        let stats = engine.pool().stats();
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_engine_rejects_foreign_buffer() {
        let mut other = BufferPool::new();
        let foreign = other.acquire(5);

        let mut engine = IndicatorEngine::new();
        let err = engine
            .simple_moving_average(&closes(), 3, Some(foreign))
            .unwrap_err();
        assert!(matches!(
            err,
            IndicatorError::Buffer(BufferMisuseError::ForeignBuffer { .. })
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_engine_bollinger_short_input_all_nan() {
        let mut engine = IndicatorEngine::new();
        let data = [1.0, 2.0];
        let bands = engine
            .bollinger_bands(&data, BollingerBandsParams::default(), None)
            .unwrap();

        for series in [&bands.middle, &bands.upper, &bands.lower] {
            assert_eq!(series.len(), 2);
            assert!(series.iter().all(|v| v.is_nan()));
        }
        engine.release_bands(bands).unwrap();
        assert_eq!(engine.pool().stats().idle, 3);
    }

    #[test]
    fn test_engine_bollinger_reuses_buffers() {
        let mut engine = IndicatorEngine::new();
        let data: Vec<f64> = (0..30).map(|i| 50.0 + i as f64).collect();
        let params = BollingerBandsParams::default();

        let bands = engine.bollinger_bands(&data, params, None).unwrap();
        let bands = engine.bollinger_bands(&data, params, Some(bands)).unwrap();
        assert_eq!(engine.pool().stats().allocations, 3);
        assert!(bands.upper[29] > bands.middle[29]);
        assert!(bands.lower[29] < bands.middle[29]);
    }

    #[test]
    fn test_engine_validates_before_allocating() {
        let mut engine = IndicatorEngine::new();
        assert!(engine.simple_moving_average(&closes(), 0, None).is_err());
        assert!(engine.exponential_moving_average(&[], 3, None).is_err());
        assert_eq!(engine.pool().stats().allocations, 0);
    }

    #[test]
    fn test_engine_bollinger_failure_returns_buffers() {
        let mut engine = IndicatorEngine::new();
        let mut other = BufferPool::new();
        let data: Vec<f64> = (0..30).map(|i| 50.0 + i as f64).collect();
        let params = BollingerBandsParams::default();

        let mut bands = engine.bollinger_bands(&data, params, None).unwrap();
        let own_lower = std::mem::replace(&mut bands.lower, other.acquire(30));
        engine.release(own_lower).unwrap();
        assert_eq!(engine.pool().stats().outstanding, 2);

        let err = engine.bollinger_bands(&data, params, Some(bands)).unwrap_err();
        assert!(matches!(
            err,
            IndicatorError::Buffer(BufferMisuseError::ForeignBuffer { .. })
        ));
        let stats = engine.pool().stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 3);

        // 파라미터 오류도 넘겨받은 버퍼를 돌려준다
        let bands = engine.bollinger_bands(&data, params, None).unwrap();
        let bad = BollingerBandsParams {
            std_dev_multiplier: -1.0,
            ..params
        };
        assert!(engine.bollinger_bands(&data, bad, Some(bands)).is_err());
        assert_eq!(engine.pool().stats().outstanding, 0);
    }

    #[test]
    fn test_engine_invalid_period_returns_given_buffer() {
        let mut engine = IndicatorEngine::new();
        let sma = engine.simple_moving_average(&closes(), 3, None).unwrap();
        assert!(engine.simple_moving_average(&closes(), 0, Some(sma)).is_err());
        assert_eq!(engine.pool().stats().outstanding, 0);
    }
}

//! 변동성 지표 (Volatility Indicators).
//!
//! - Bollinger Bands (중간/상단/하단 밴드, %B, 밴드 폭)
//!
//! 분산은 각 인덱스마다 창 전체를 다시 순회해 `(x - mean)²`의 합으로 구합니다.
//! `E[x²] - E[x]²` 형태의 누적 공식은 10만 단위 가격에서 상쇄 오차가 커서 쓰지 않습니다.

use serde::{Deserialize, Serialize};

use super::trend::sma_into;
use super::{check_output, check_period, IndicatorError, IndicatorResult};

/// 볼린저 밴드 파라미터.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBandsParams {
    /// 이동평균 기간 (기본: 20).
    pub period: usize,
    /// 표준편차 배수 (기본: 2.0).
    pub std_dev_multiplier: f64,
}

impl Default for BollingerBandsParams {
    fn default() -> Self {
        Self {
            period: 20,
            std_dev_multiplier: 2.0,
        }
    }
}

impl BollingerBandsParams {
    /// 파라미터 유효성 검사.
    pub fn validate(&self) -> IndicatorResult<()> {
        if !(self.std_dev_multiplier.is_finite() && self.std_dev_multiplier >= 0.0) {
            return Err(IndicatorError::InvalidParameter(format!(
                "표준편차 배수는 0 이상의 유한값이어야 합니다: {}",
                self.std_dev_multiplier
            )));
        }
        Ok(())
    }
}

/// 볼린저 밴드를 세 출력 슬라이스에 계산합니다.
pub fn bollinger_into(
    data: &[f64],
    params: BollingerBandsParams,
    middle: &mut [f64],
    upper: &mut [f64],
    lower: &mut [f64],
) -> IndicatorResult<()> {
    let period = params.period;
    check_period(data, period)?;
    params.validate()?;
    check_output(data.len(), middle.len())?;
    check_output(data.len(), upper.len())?;
    check_output(data.len(), lower.len())?;

    sma_into(data, period, middle)?;

    let n = data.len();
    let warmup = (period - 1).min(n);
    upper[..warmup].fill(f64::NAN);
    lower[..warmup].fill(f64::NAN);

    let divisor = period as f64;
    for i in warmup..n {
        let mean = middle[i];
        let window = &data[i + 1 - period..=i];
        let sum_sq: f64 = window
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum();

        let deviation = (sum_sq / divisor).sqrt() * params.std_dev_multiplier;
        upper[i] = mean + deviation;
        lower[i] = mean - deviation;
    }

    Ok(())
}

/// %B = (가격 - 하단) / (상단 - 하단). 밴드가 수렴하면 0.5.
pub fn percent_b_into(
    data: &[f64],
    upper: &[f64],
    lower: &[f64],
    out: &mut [f64],
) -> IndicatorResult<()> {
    check_output(data.len(), upper.len())?;
    check_output(data.len(), lower.len())?;
    check_output(data.len(), out.len())?;

    for i in 0..data.len() {
        let width = upper[i] - lower[i];
        out[i] = if width.is_nan() {
            f64::NAN
        } else if width == 0.0 {
            0.5
        } else {
            (data[i] - lower[i]) / width
        };
    }
    Ok(())
}

/// 밴드 폭 = (상단 - 하단) / 중간. 중간 밴드가 0이면 NaN.
pub fn bandwidth_into(
    middle: &[f64],
    upper: &[f64],
    lower: &[f64],
    out: &mut [f64],
) -> IndicatorResult<()> {
    check_output(middle.len(), upper.len())?;
    check_output(middle.len(), lower.len())?;
    check_output(middle.len(), out.len())?;

    for i in 0..middle.len() {
        out[i] = if middle[i] == 0.0 {
            f64::NAN
        } else {
            (upper[i] - lower[i]) / middle[i]
        };
    }
    Ok(())
}

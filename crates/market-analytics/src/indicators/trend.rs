//! 추세 지표 (Trend Indicators).
//!
//! - SMA (Simple Moving Average)
//! - EMA (Exponential Moving Average)
//!
//! 모든 커널은 입력과 같은 길이의 출력 슬라이스에 결과를 씁니다.
//! 워밍업 구간(`i < period - 1`)은 NaN입니다.

use super::{check_output, check_period, IndicatorResult};

/// 단순 이동평균을 `out`에 계산합니다.
///
/// 누적합을 슬라이딩하되 `period` 스텝마다 창 합계를 다시 계산해
/// 큰 가격대에서도 부동소수점 오차가 쌓이지 않게 합니다.
/// 입력이 `period`보다 짧으면 출력 전체가 NaN이며 에러가 아닙니다.
pub fn sma_into(data: &[f64], period: usize, out: &mut [f64]) -> IndicatorResult<()> {
    check_period(data, period)?;
    check_output(data.len(), out.len())?;

    let n = data.len();
    if n < period {
        out.fill(f64::NAN);
        return Ok(());
    }

    out[..period - 1].fill(f64::NAN);

    let divisor = period as f64;
    let mut sum: f64 = data[..period].iter().sum();
    out[period - 1] = sum / divisor;

    for i in period..n {
        let start = i + 1 - period;
        if start % period == 0 {
            // 재기준: 창 합계를 새로 계산 (누적 오차 및 NaN 전파 차단)
            sum = data[start..=i].iter().sum();
        } else {
            sum += data[i] - data[i - period];
        }
        out[i] = sum / divisor;
    }

    Ok(())
}

/// 지수 이동평균을 `out`에 계산합니다.
///
/// 첫 값은 처음 `period`개의 단순 평균으로 시작하며 α = 2 / (period + 1)입니다.
pub fn ema_into(data: &[f64], period: usize, out: &mut [f64]) -> IndicatorResult<()> {
    check_period(data, period)?;
    check_output(data.len(), out.len())?;

    let n = data.len();
    if n < period {
        out.fill(f64::NAN);
        return Ok(());
    }

    out[..period - 1].fill(f64::NAN);

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema = data[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = ema;

    for i in period..n {
        ema += (data[i] - ema) * alpha;
        out[i] = ema;
    }

    Ok(())
}

//! 모멘텀 지표 (Momentum Indicators).
//!
//! - RSI (Relative Strength Index, Wilder 평활)

use super::{check_output, check_period, IndicatorResult};

/// RSI를 `out`에 계산합니다.
///
/// RSI = 100 - (100 / (1 + RS)), RS = 평균 상승폭 / 평균 하락폭.
/// 첫 평균은 처음 `period`개 변화량의 단순 평균이고 이후는
/// `avg = (avg × (period - 1) + x) / period`로 평활합니다.
///
/// 변화량이 `period`개 모이기 전(`i < period`)은 NaN입니다.
pub fn rsi_into(data: &[f64], period: usize, out: &mut [f64]) -> IndicatorResult<()> {
    check_period(data, period)?;
    check_output(data.len(), out.len())?;

    let n = data.len();
    if n <= period {
        out.fill(f64::NAN);
        return Ok(());
    }

    out[..period].fill(f64::NAN);

    let p = period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = data[i] - data[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= p;
    avg_loss /= p;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in (period + 1)..n {
        let delta = data[i] - data[i - 1];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        out[i] = rsi_value(avg_gain, avg_loss);
    }

    Ok(())
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

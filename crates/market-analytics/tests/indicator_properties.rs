//! 지표 커널의 속성 테스트.
//!
//! 모든 결과를 O(N·p) 기준 구현과 비교합니다.

use market_analytics::indicators::{bollinger_into, sma_into, BollingerBandsParams};
use market_analytics::{BufferPool, IndicatorEngine};
use proptest::prelude::*;

fn reference_sma(data: &[f64], period: usize) -> Vec<f64> {
    (0..data.len())
        .map(|i| {
            if i + 1 < period {
                f64::NAN
            } else {
                data[i + 1 - period..=i].iter().sum::<f64>() / period as f64
            }
        })
        .collect()
}

fn reference_std(data: &[f64], period: usize, i: usize) -> f64 {
    let window = &data[i + 1 - period..=i];
    let mean = window.iter().sum::<f64>() / period as f64;
    let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
    var.sqrt()
}

fn close_enough(a: f64, b: f64, scale: f64) -> bool {
    (a - b).abs() <= 1e-9 * scale.max(1.0)
}

proptest! {
    #[test]
    fn sma_matches_reference(
        data in prop::collection::vec(1.0f64..1_000.0, 1..300),
        period in 1usize..60,
    ) {
        let mut out = vec![0.0; data.len()];
        sma_into(&data, period, &mut out).unwrap();
        let expected = reference_sma(&data, period);

        prop_assert_eq!(out.len(), data.len());
        for (i, (a, b)) in out.iter().zip(expected.iter()).enumerate() {
            if i + 1 < period {
                prop_assert!(a.is_nan());
            } else {
                prop_assert!(close_enough(*a, *b, b.abs()), "i={} got={} want={}", i, a, b);
            }
        }
    }

    #[test]
    fn sma_large_magnitude_matches_reference(
        noise in prop::collection::vec(-5.0f64..5.0, 50..400),
        period in 2usize..200,
    ) {
        let data: Vec<f64> = noise.iter().map(|n| 100_000.0 + n).collect();
        let mut out = vec![0.0; data.len()];
        sma_into(&data, period, &mut out).unwrap();
        let expected = reference_sma(&data, period);

        for i in (period - 1).min(data.len())..data.len() {
            prop_assert!((out[i] - expected[i]).abs() < 1e-6, "i={} drift={}", i, out[i] - expected[i]);
        }
    }

    #[test]
    fn bollinger_short_input_is_all_nan(
        data in prop::collection::vec(-1e6f64..1e6, 1..50),
        extra in 1usize..50,
    ) {
        let period = data.len() + extra;
        let n = data.len();
        let (mut m, mut u, mut l) = (vec![0.0; n], vec![0.0; n], vec![0.0; n]);
        let params = BollingerBandsParams { period, std_dev_multiplier: 2.0 };
        bollinger_into(&data, params, &mut m, &mut u, &mut l).unwrap();

        prop_assert!(m.iter().chain(u.iter()).chain(l.iter()).all(|v| v.is_nan()));
    }

    #[test]
    fn bollinger_bands_match_two_pass_reference(
        noise in prop::collection::vec(-2.0f64..2.0, 30..200),
        period in 2usize..30,
        k in 0.5f64..3.0,
    ) {
        let data: Vec<f64> = noise.iter().map(|n| 100_000.0 + n).collect();
        let n = data.len();
        let (mut m, mut u, mut l) = (vec![0.0; n], vec![0.0; n], vec![0.0; n]);
        let params = BollingerBandsParams { period, std_dev_multiplier: k };
        bollinger_into(&data, params, &mut m, &mut u, &mut l).unwrap();

        for i in (period - 1)..n {
            let sd = reference_std(&data, period, i);
            prop_assert!(((u[i] - m[i]) - sd * k).abs() < 1e-6);
            prop_assert!(((m[i] - l[i]) - sd * k).abs() < 1e-6);
        }
    }

    #[test]
    fn pool_returns_exact_length(lengths in prop::collection::vec(0usize..512, 1..50)) {
        let mut pool = BufferPool::new();
        for len in lengths {
            let buf = pool.acquire(len);
            prop_assert_eq!(buf.len(), len);
            pool.release(buf).unwrap();
            let again = pool.acquire(len);
            prop_assert_eq!(again.len(), len);
            pool.release(again).unwrap();
        }
        prop_assert_eq!(pool.stats().outstanding, 0);
    }
}

#[test]
fn online_variance_would_cancel_but_engine_does_not() {
    // E[x²] - E[x]² 공식은 이 입력에서 눈에 띄는 오차를 낸다
    let data: Vec<f64> = (0..64)
        .map(|i| 100_000_000.0 + (i % 4) as f64 * 0.001)
        .collect();
    let period = 16;
    let i = 63;

    let window = &data[i + 1 - period..=i];
    let mean = window.iter().sum::<f64>() / period as f64;
    let mean_sq = window.iter().map(|x| x * x).sum::<f64>() / period as f64;
    let naive_sd = (mean_sq - mean * mean).max(0.0).sqrt();
    let true_sd = reference_std(&data, period, i);

    let mut engine = IndicatorEngine::new();
    let params = BollingerBandsParams {
        period,
        std_dev_multiplier: 1.0,
    };
    let bands = engine.bollinger_bands(&data, params, None).unwrap();
    let engine_sd = bands.upper[i] - bands.middle[i];

    assert!((engine_sd - true_sd).abs() < 1e-6);
    assert!((naive_sd - true_sd).abs() > (engine_sd - true_sd).abs());
}

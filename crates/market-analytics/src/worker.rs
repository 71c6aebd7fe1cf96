//! 지표 계산 전용 워커 스레드.
//!
//! CPU 작업인 지표 재계산이 이벤트 루프의 메시지 전달을 막지 않도록
//! [`IndicatorEngine`]과 그 버퍼 풀을 별도 OS 스레드가 소유합니다.
//!
//! 메시지 계약:
//! - 입력: `{ klines, settings, enabled_indicators }`
//! - 출력: `{ 지표명: 시계열, ... }`

use std::collections::BTreeMap;
use std::thread::JoinHandle;
use std::time::Instant;

use market_core::{closes, IndicatorDefaults, Kline};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::indicators::{
    bandwidth_into, percent_b_into, BollingerBandsParams, IndicatorEngine, IndicatorError,
    IndicatorResult,
};

/// 작업 큐 깊이.
const JOB_QUEUE_DEPTH: usize = 64;

/// 계산할 지표 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    /// 단순 이동평균
    Sma,
    /// 지수 이동평균
    Ema,
    /// 상대강도지수
    Rsi,
    /// 볼린저 밴드 (중간/상단/하단/%B/폭)
    BollingerBands,
}

impl IndicatorKind {
    /// 이 지표가 만들어내는 출력 채널 이름.
    pub fn output_names(&self) -> &'static [&'static str] {
        match self {
            IndicatorKind::Sma => &["sma"],
            IndicatorKind::Ema => &["ema"],
            IndicatorKind::Rsi => &["rsi"],
            IndicatorKind::BollingerBands => &[
                "bb_middle",
                "bb_upper",
                "bb_lower",
                "bb_percent_b",
                "bb_bandwidth",
            ],
        }
    }
}

/// 지표 파라미터 묶음.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSettings {
    pub sma_period: usize,
    pub ema_period: usize,
    pub rsi_period: usize,
    pub bollinger_period: usize,
    pub bollinger_std_dev: f64,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self::from(&IndicatorDefaults::default())
    }
}

impl From<&IndicatorDefaults> for IndicatorSettings {
    fn from(defaults: &IndicatorDefaults) -> Self {
        Self {
            sma_period: defaults.sma_period,
            ema_period: defaults.ema_period,
            rsi_period: defaults.rsi_period,
            bollinger_period: defaults.bollinger_period,
            bollinger_std_dev: defaults.bollinger_std_dev,
        }
    }
}

/// 워커 입력 메시지.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorRequest {
    pub klines: Vec<Kline>,
    pub settings: IndicatorSettings,
    pub enabled_indicators: Vec<IndicatorKind>,
}

/// 워커 출력 메시지: 지표명 → 시계열.
///
/// JSON으로 직렬화하면 NaN 워밍업 값은 `null`이 되고, 역직렬화하면 `null`은 다시 NaN이 됩니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorOutput {
    #[serde(deserialize_with = "deserialize_series")]
    pub series: BTreeMap<String, Vec<f64>>,
}

fn deserialize_series<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Vec<Option<f64>>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, values)| {
            let values = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
            (name, values)
        })
        .collect())
}

impl IndicatorOutput {
    /// 이름으로 시계열을 조회합니다.
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series.get(name).map(Vec::as_slice)
    }

    /// 가장 최근 값 (마지막 인덱스).
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|s| s.last().copied())
    }
}

/// 요청 하나를 동기적으로 계산합니다.
///
/// 엔진 버퍼에서 계산한 결과를 출력으로 복사한 뒤 버퍼는 즉시 풀에 반납합니다.
/// 활성화된 지표가 없거나 캔들이 비어 있으면 빈 출력을 반환합니다.
pub fn compute_indicators(
    engine: &mut IndicatorEngine,
    request: &IndicatorRequest,
) -> IndicatorResult<IndicatorOutput> {
    let mut output = IndicatorOutput::default();
    if request.klines.is_empty() || request.enabled_indicators.is_empty() {
        return Ok(output);
    }

    let prices = closes(&request.klines);
    let settings = &request.settings;

    let mut enabled = request.enabled_indicators.clone();
    enabled.sort();
    enabled.dedup();

    for kind in enabled {
        match kind {
            IndicatorKind::Sma => {
                let buf = engine.simple_moving_average(&prices, settings.sma_period, None)?;
                output.series.insert("sma".to_string(), buf.to_vec());
                engine.release(buf)?;
            }
            IndicatorKind::Ema => {
                let buf = engine.exponential_moving_average(&prices, settings.ema_period, None)?;
                output.series.insert("ema".to_string(), buf.to_vec());
                engine.release(buf)?;
            }
            IndicatorKind::Rsi => {
                let buf = engine.relative_strength_index(&prices, settings.rsi_period, None)?;
                output.series.insert("rsi".to_string(), buf.to_vec());
                engine.release(buf)?;
            }
            IndicatorKind::BollingerBands => {
                let params = BollingerBandsParams {
                    period: settings.bollinger_period,
                    std_dev_multiplier: settings.bollinger_std_dev,
                };
                let bands = engine.bollinger_bands(&prices, params, None)?;

                let mut percent_b = vec![f64::NAN; prices.len()];
                percent_b_into(&prices, &bands.upper, &bands.lower, &mut percent_b)?;
                let mut bandwidth = vec![f64::NAN; prices.len()];
                bandwidth_into(&bands.middle, &bands.upper, &bands.lower, &mut bandwidth)?;

                output.series.insert("bb_middle".to_string(), bands.middle.to_vec());
                output.series.insert("bb_upper".to_string(), bands.upper.to_vec());
                output.series.insert("bb_lower".to_string(), bands.lower.to_vec());
                output.series.insert("bb_percent_b".to_string(), percent_b);
                output.series.insert("bb_bandwidth".to_string(), bandwidth);
                engine.release_bands(bands)?;
            }
        }
    }

    Ok(output)
}

struct Job {
    request: IndicatorRequest,
    reply: oneshot::Sender<IndicatorResult<IndicatorOutput>>,
}

/// 지표 워커 핸들.
///
/// 핸들을 drop하면 작업 채널이 닫히고 스레드는 남은 작업을 끝낸 뒤 종료합니다.
pub struct IndicatorWorker {
    tx: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl IndicatorWorker {
    /// 워커 스레드를 시작합니다.
    pub fn spawn() -> IndicatorResult<Self> {
        Self::spawn_with_engine(IndicatorEngine::new())
    }

    /// 주어진 엔진으로 워커 스레드를 시작합니다.
    pub fn spawn_with_engine(mut engine: IndicatorEngine) -> IndicatorResult<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);

        let handle = std::thread::Builder::new()
            .name("indicator-worker".to_string())
            .spawn(move || {
                info!("지표 워커 시작");
                while let Some(job) = rx.blocking_recv() {
                    let started = Instant::now();
                    let result = compute_indicators(&mut engine, &job.request);

                    if let Err(e) = &result {
                        error!(error = %e, "지표 계산 실패");
                    } else {
                        debug!(
                            klines = job.request.klines.len(),
                            indicators = job.request.enabled_indicators.len(),
                            elapsed_us = started.elapsed().as_micros() as u64,
                            "지표 계산 완료"
                        );
                    }

                    if job.reply.send(result).is_err() {
                        debug!("요청자가 결과 수신 전에 취소됨");
                    }
                }
                let stats = engine.pool().stats();
                info!(
                    allocations = stats.allocations,
                    reuses = stats.reuses,
                    "지표 워커 종료"
                );
            })
            .map_err(|e| IndicatorError::WorkerUnavailable(e.to_string()))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// 요청을 워커에 보내고 결과를 기다립니다.
    pub async fn compute(&self, request: IndicatorRequest) -> IndicatorResult<IndicatorOutput> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| IndicatorError::WorkerUnavailable("워커가 종료됨".to_string()))?;

        let (reply, rx) = oneshot::channel();
        tx.send(Job { request, reply })
            .await
            .map_err(|_| IndicatorError::WorkerUnavailable("작업 채널 닫힘".to_string()))?;

        rx.await
            .map_err(|_| IndicatorError::WorkerUnavailable("워커가 응답 없이 종료됨".to_string()))?
    }

    /// 채널을 닫고 스레드 종료를 기다립니다.
    pub async fn shutdown(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("지표 워커 스레드가 비정상 종료됨");
            }
        }
    }
}

impl Drop for IndicatorWorker {
    fn drop(&mut self) {
        // 채널만 닫는다. 스레드는 남은 작업을 처리하고 스스로 끝난다.
        self.tx.take();
    }
}

//! 지수 백오프와 재시도 헬퍼.
//!
//! WebSocket 재연결과 REST 재시도가 같은 정책 타입을 공유합니다.
//! 지연 시간 = min(initial × multiplier^attempt, max) × jitter(0.8~1.2), 다시 max로 상한.

use crate::config::BackoffSettings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 지터 하한 배수.
const JITTER_LOW: f64 = 0.8;
/// 지터 상한 배수.
const JITTER_HIGH: f64 = 1.2;

/// 지수 백오프 정책.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// 첫 재시도 지연
    pub initial_delay: Duration,
    /// 최대 지연
    pub max_delay: Duration,
    /// 시도마다 곱해지는 배수
    pub multiplier: f64,
    /// 지터 적용 여부
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffSettings::default())
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

impl BackoffPolicy {
    /// 새 정책을 생성합니다.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// 배수를 설정합니다.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// 지터 사용 여부를 설정합니다.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// 지터를 제외한 `attempt`번째(0부터) 지연.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let raw = (initial_ms * exp).min(max_ms);
        Duration::from_millis(raw as u64)
    }

    /// `attempt`번째 지연에 지터를 적용한 값.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.jitter {
            return self.base_delay(attempt);
        }
        let factor = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        self.jittered(attempt, factor)
    }

    /// 주어진 지터 배수로 지연을 계산합니다. 결과는 항상 `max_delay` 이하입니다.
    pub fn jittered(&self, attempt: u32, factor: f64) -> Duration {
        let factor = factor.clamp(JITTER_LOW, JITTER_HIGH);
        let base_ms = self.base_delay(attempt).as_millis() as f64;
        let capped = (base_ms * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 재시도 가능한 에러에 대해 백오프를 두고 작업을 반복합니다.
///
/// `max_attempts`는 첫 시도를 포함한 총 시도 횟수입니다.
/// 재시도 불가 에러나 마지막 시도의 에러는 그대로 반환됩니다.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "작업 실패, 재시도 예정"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

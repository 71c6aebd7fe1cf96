//! 파이프라인 설정 관리.
//!
//! 모든 설정 항목은 명시적인 필드로 열거되며 각각 기본값을 가집니다.
//! 로드 순서: 기본값 → TOML 파일(선택) → `MARKET__*` 환경 변수.
//!
//! ```toml
//! [polling]
//! base_interval_ms = 5000
//!
//! [cache]
//! ttl_ms = 900000
//! kline_ttl_ms = 10000
//! max_size = 100
//! ```
//!
//! 환경 변수 예: `MARKET__CACHE__MAX_SIZE=200`.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 폴링 기본 주기의 하한 (밀리초).
pub const MIN_BASE_INTERVAL_MS: u64 = 2_000;

/// 파이프라인 전체 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 로깅 설정
    pub logging: LoggingConfig,
    /// WebSocket 연결 설정
    pub websocket: WebSocketSettings,
    /// 재연결 백오프 설정
    pub backoff: BackoffSettings,
    /// 요청 병합 캐시 설정
    pub cache: CacheSettings,
    /// REST 폴링 설정
    pub polling: PollingSettings,
    /// 적응형 스케줄러 설정
    pub scheduler: SchedulerSettings,
    /// 지표 기본 파라미터
    pub indicators: IndicatorDefaults,
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// WebSocket 연결 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketSettings {
    /// 공개 시세 채널 URL (wss 필수)
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// 개인 채널 URL (wss 필수)
    #[serde(default = "default_private_url")]
    pub private_url: String,
    /// 핑 전송 주기
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// 수신이 없을 때 재연결까지의 시간
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    /// 핸드셰이크 제한 시간
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 연속으로 응답 없는 핑 허용 횟수
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
    /// 강제 재연결을 유발하는 디코딩 에러 수
    #[serde(default = "default_error_burst_threshold")]
    pub error_burst_threshold: u32,
    /// 디코딩 에러 집계 구간
    #[serde(default = "default_error_burst_window_ms")]
    pub error_burst_window_ms: u64,
}

fn default_public_url() -> String {
    "wss://fapi.bitunix.com/public/".to_string()
}
fn default_private_url() -> String {
    "wss://fapi.bitunix.com/private/".to_string()
}
fn default_ping_interval_ms() -> u64 {
    5_000
}
fn default_watchdog_timeout_ms() -> u64 {
    20_000
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_max_missed_pongs() -> u32 {
    3
}
fn default_error_burst_threshold() -> u32 {
    5
}
fn default_error_burst_window_ms() -> u64 {
    10_000
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            private_url: default_private_url(),
            ping_interval_ms: default_ping_interval_ms(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_missed_pongs: default_max_missed_pongs(),
            error_burst_threshold: default_error_burst_threshold(),
            error_burst_window_ms: default_error_burst_window_ms(),
        }
    }
}

/// 지수 백오프 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffSettings {
    /// 첫 재시도 지연
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// 최대 지연 (상한)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 시도마다 곱해지는 배수
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 0.8~1.2배 지터 적용 여부
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

/// 요청 병합 캐시 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// 엔트리 유효 시간 (히스토리, 단발 조회)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// 실시간 폴링 캐시의 유효 시간 상한
    #[serde(default = "default_kline_ttl_ms")]
    pub kline_ttl_ms: u64,
    /// 최대 엔트리 수
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// 만료 후에도 폴백용으로 보관하는 시간
    #[serde(default = "default_stale_grace_ms")]
    pub stale_grace_ms: u64,
}

fn default_ttl_ms() -> u64 {
    15 * 60 * 1_000
}
fn default_kline_ttl_ms() -> u64 {
    10_000
}
fn default_max_size() -> usize {
    100
}
fn default_stale_grace_ms() -> u64 {
    60 * 60 * 1_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            kline_ttl_ms: default_kline_ttl_ms(),
            max_size: default_max_size(),
            stale_grace_ms: default_stale_grace_ms(),
        }
    }
}

/// REST 폴링 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingSettings {
    /// REST API 기본 URL
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    /// 기본 폴링 주기 (2000ms 미만은 2000ms로 보정)
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    /// 사용자가 보고 있는 심볼의 빠른 주기
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,
    /// 요청당 제한 시간
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// 동시에 진행할 수 있는 폴링 수
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,
    /// 이 시간 동안 WebSocket 틱이 없으면 폴링으로 공백을 메움
    #[serde(default = "default_stale_gap_ms")]
    pub stale_gap_ms: u64,
    /// 폴링당 요청할 캔들 수
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 캐시 키에 들어가는 요금제 이름
    #[serde(default)]
    pub plan: Option<String>,
}

fn default_rest_base_url() -> String {
    "https://fapi.bitunix.com".to_string()
}
fn default_base_interval_ms() -> u64 {
    5_000
}
fn default_fast_interval_ms() -> u64 {
    1_000
}
fn default_fetch_timeout_ms() -> u64 {
    10_000
}
fn default_max_concurrent_polls() -> usize {
    6
}
fn default_stale_gap_ms() -> u64 {
    10_000
}
fn default_limit() -> usize {
    200
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            base_interval_ms: default_base_interval_ms(),
            fast_interval_ms: default_fast_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_concurrent_polls: default_max_concurrent_polls(),
            stale_gap_ms: default_stale_gap_ms(),
            limit: default_limit(),
            plan: None,
        }
    }
}

impl PollingSettings {
    /// 하한이 적용된 기본 주기.
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms.max(MIN_BASE_INTERVAL_MS))
    }
}

/// 적응형 스케줄러 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    /// 마지막 입력 후 이 시간이 지나면 유휴 상태로 간주
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    /// 화면이 숨겨졌을 때의 최소 지연
    #[serde(default = "default_hidden_floor_ms")]
    pub hidden_floor_ms: u64,
    /// 활성 심볼이지만 유휴 상태일 때의 지연
    #[serde(default = "default_active_idle_ms")]
    pub active_idle_ms: u64,
    /// 빠른 주기의 하한
    #[serde(default = "default_fast_floor_ms")]
    pub fast_floor_ms: u64,
    /// 어떤 경우에도 이보다 짧은 지연은 반환하지 않음
    #[serde(default = "default_absolute_floor_ms")]
    pub absolute_floor_ms: u64,
    /// 기본 주기에 더해지는 최대 지터
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_idle_threshold_ms() -> u64 {
    60_000
}
fn default_hidden_floor_ms() -> u64 {
    10_000
}
fn default_active_idle_ms() -> u64 {
    1_000
}
fn default_fast_floor_ms() -> u64 {
    100
}
fn default_absolute_floor_ms() -> u64 {
    100
}
fn default_max_jitter_ms() -> u64 {
    500
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            hidden_floor_ms: default_hidden_floor_ms(),
            active_idle_ms: default_active_idle_ms(),
            fast_floor_ms: default_fast_floor_ms(),
            absolute_floor_ms: default_absolute_floor_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

/// 지표 기본 파라미터.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorDefaults {
    /// SMA 기간
    #[serde(default = "default_period")]
    pub sma_period: usize,
    /// EMA 기간
    #[serde(default = "default_period")]
    pub ema_period: usize,
    /// RSI 기간
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    /// 볼린저 밴드 기간
    #[serde(default = "default_period")]
    pub bollinger_period: usize,
    /// 볼린저 밴드 표준편차 배수
    #[serde(default = "default_std_dev_multiplier")]
    pub bollinger_std_dev: f64,
    /// 타깃당 보관할 최대 캔들 수
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_period() -> usize {
    20
}
fn default_rsi_period() -> usize {
    14
}
fn default_std_dev_multiplier() -> f64 {
    2.0
}
fn default_max_history() -> usize {
    1_000
}

impl Default for IndicatorDefaults {
    fn default() -> Self {
        Self {
            sma_period: default_period(),
            ema_period: default_period(),
            rsi_period: default_rsi_period(),
            bollinger_period: default_period(),
            bollinger_std_dev: default_std_dev_multiplier(),
            max_history: default_max_history(),
        }
    }
}

impl PipelineConfig {
    /// 파일 + 환경 변수에서 설정을 로드합니다.
    ///
    /// 파일이 없으면 기본값과 환경 변수만 사용합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let builder = ::config::Config::builder()
            // 파일에서 로드 (선택)
            .add_source(::config::File::from(path.as_ref()).required(false))
            // 환경 변수로 오버라이드
            .add_source(
                ::config::Environment::with_prefix("MARKET")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> CoreResult<Self> {
        Self::load("config/default.toml")
    }

    /// 값의 일관성을 검사합니다.
    pub fn validate(&self) -> CoreResult<()> {
        if self.cache.max_size == 0 {
            return Err(CoreError::Config("cache.max_size는 1 이상이어야 합니다".into()));
        }
        if self.cache.ttl_ms == 0 {
            return Err(CoreError::Config("cache.ttl_ms는 0일 수 없습니다".into()));
        }
        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            return Err(CoreError::Config(
                "backoff.max_delay_ms가 initial_delay_ms보다 작습니다".into(),
            ));
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            return Err(CoreError::Config("backoff.multiplier는 1.0 이상이어야 합니다".into()));
        }
        if self.polling.max_concurrent_polls == 0 || self.polling.limit == 0 {
            return Err(CoreError::Config(
                "polling.max_concurrent_polls와 polling.limit는 1 이상이어야 합니다".into(),
            ));
        }
        if self.websocket.ping_interval_ms == 0 {
            return Err(CoreError::Config("websocket.ping_interval_ms는 0일 수 없습니다".into()));
        }
        let periods = [
            self.indicators.sma_period,
            self.indicators.ema_period,
            self.indicators.rsi_period,
            self.indicators.bollinger_period,
        ];
        if periods.contains(&0) {
            return Err(CoreError::Config("지표 기간은 1 이상이어야 합니다".into()));
        }
        Ok(())
    }
}

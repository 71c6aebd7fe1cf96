//! 캔들 타임프레임 정의.
//!
//! REST 폴링 파라미터와 WebSocket 채널명 모두 이 타입에서 파생됩니다.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const KLINE_CHANNEL_PREFIX: &str = "market_kline_";

/// 캔들스틱 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1분봉
    #[serde(rename = "1m")]
    M1,
    /// 3분봉
    #[serde(rename = "3m")]
    M3,
    /// 5분봉
    #[serde(rename = "5m")]
    M5,
    /// 15분봉
    #[serde(rename = "15m")]
    M15,
    /// 30분봉
    #[serde(rename = "30m")]
    M30,
    /// 1시간봉
    #[serde(rename = "1h")]
    H1,
    /// 4시간봉
    #[serde(rename = "4h")]
    H4,
    /// 일봉
    #[serde(rename = "1d")]
    D1,
    /// 주봉
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// 지원되는 모든 타임프레임.
    pub const ALL: [Timeframe; 9] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// 이 타임프레임의 기간을 반환합니다.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M3 => Duration::from_secs(3 * 60),
            Timeframe::M5 => Duration::from_secs(5 * 60),
            Timeframe::M15 => Duration::from_secs(15 * 60),
            Timeframe::M30 => Duration::from_secs(30 * 60),
            Timeframe::H1 => Duration::from_secs(60 * 60),
            Timeframe::H4 => Duration::from_secs(4 * 60 * 60),
            Timeframe::D1 => Duration::from_secs(24 * 60 * 60),
            Timeframe::W1 => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// 밀리초 단위 기간.
    pub fn as_millis(&self) -> i64 {
        self.duration().as_millis() as i64
    }

    /// REST 요청에 쓰이는 간격 문자열.
    pub fn as_interval(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// 간격 문자열에서 파싱합니다.
    pub fn from_interval(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tf| tf.as_interval() == s)
    }

    /// 거래소 API의 간격 문자열 (REST `interval` 파라미터와 WebSocket 채널 접미사).
    pub fn as_exchange_interval(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1min",
            Timeframe::M3 => "3min",
            Timeframe::M5 => "5min",
            Timeframe::M15 => "15min",
            Timeframe::M30 => "30min",
            Timeframe::H1 => "60min",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1day",
            Timeframe::W1 => "1week",
        }
    }

    /// WebSocket 캔들 채널명 (예: `market_kline_1min`).
    pub fn kline_channel(&self) -> String {
        format!("{}{}", KLINE_CHANNEL_PREFIX, self.as_exchange_interval())
    }

    /// 캔들 채널명에서 타임프레임을 역으로 찾습니다.
    pub fn from_kline_channel(channel: &str) -> Option<Self> {
        let suffix = channel.strip_prefix(KLINE_CHANNEL_PREFIX)?;
        Self::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_exchange_interval() == suffix)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_interval())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_interval(s).ok_or_else(|| format!("Invalid timeframe: {}", s))
    }
}

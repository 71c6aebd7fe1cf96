//! 에러 타입 정의.

use market_analytics::IndicatorError;
use market_core::CoreError;
use market_data::DataError;
use market_stream::StreamError;
use thiserror::Error;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(#[from] CoreError),

    /// 데이터 소스 에러 (REST, 캐시)
    #[error("데이터 소스 에러: {0}")]
    Data(#[from] DataError),

    /// WebSocket 에러
    #[error("스트림 에러: {0}")]
    Stream(#[from] StreamError),

    /// 지표 계산 에러
    #[error("지표 에러: {0}")]
    Indicator(#[from] IndicatorError),

    /// 잘못된 수집 대상
    #[error("잘못된 대상: {0}")]
    InvalidTarget(String),
}

impl CollectorError {
    /// 프로세스를 중단해야 하는 에러인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::InvalidTarget(_) => true,
            Self::Stream(e) => e.is_fatal(),
            Self::Data(_) | Self::Indicator(_) => false,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let insecure: CollectorError =
            StreamError::TransportSecurity("ws://example.test".to_string()).into();
        assert!(insecure.is_fatal());

        let transient: CollectorError = StreamError::Transport("reset".to_string()).into();
        assert!(!transient.is_fatal());

        let rate_limited: CollectorError = DataError::UpstreamRateLimited {
            provider: "bitunix".to_string(),
            retry_after_ms: None,
        }
        .into();
        assert!(!rate_limited.is_fatal());
        assert!(CollectorError::InvalidTarget("BTC".to_string()).is_fatal());
    }
}

//! 데이터 모듈 오류 타입.
//!
//! 병합된 요청의 결과를 여러 호출자가 공유하므로 `Clone`이어야 합니다.

use thiserror::Error;

/// 데이터 관련 오류.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    /// 업스트림 요청 한도 초과 (HTTP 429 등)
    #[error("요청 한도 초과 ({provider})")]
    UpstreamRateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    /// 업스트림 페이로드 구조 검증 실패 (캐시하지 않음)
    #[error("스키마 검증 실패: {0}")]
    SchemaValidation(String),

    /// 심볼을 찾을 수 없음
    #[error("심볼을 찾을 수 없음: {0}")]
    SymbolNotFound(String),

    /// 2xx가 아닌 HTTP 응답
    #[error("HTTP 에러 {status}: {message}")]
    Http { status: u16, message: String },

    /// 네트워크 오류
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 타임아웃
    #[error("요청 타임아웃: {0}")]
    Timeout(String),

    /// 직렬화/역직렬화 오류
    #[error("직렬화 에러: {0}")]
    Serialization(String),

    /// 잘못된 요청 파라미터
    #[error("잘못된 요청: {0}")]
    InvalidRequest(String),
}

impl DataError {
    /// 요청 한도/쿼터 소진 에러인지 확인합니다.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DataError::UpstreamRateLimited { .. })
    }

    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::UpstreamRateLimited { .. }
            | DataError::Network(_)
            | DataError::Timeout(_) => true,
            DataError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// 권장 재시도 지연 (밀리초).
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            DataError::UpstreamRateLimited { retry_after_ms, .. } => {
                Some(retry_after_ms.unwrap_or(60_000))
            }
            DataError::Network(_) | DataError::Timeout(_) => Some(1_000),
            DataError::Http { status, .. } if *status >= 500 => Some(2_000),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DataError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DataError::Timeout(err.to_string())
        } else if err.is_decode() {
            DataError::SchemaValidation(err.to_string())
        } else if let Some(status) = err.status() {
            DataError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            DataError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

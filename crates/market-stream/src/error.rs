//! 스트림 모듈 오류 타입.

use thiserror::Error;

/// WebSocket 스트림 오류.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// 암호화되지 않은 엔드포인트 (연결 시도 자체를 하지 않음)
    #[error("보안 연결이 아닌 URL은 허용되지 않습니다: {0}")]
    TransportSecurity(String),

    /// 핸드셰이크/송수신 실패
    #[error("전송 에러: {0}")]
    Transport(String),

    /// 핸드셰이크 제한 시간 초과
    #[error("연결 타임아웃: {0}ms")]
    Timeout(u64),

    /// 이미 파기된 연결
    #[error("연결이 파기되었습니다")]
    Destroyed,

    /// URL 파싱 실패
    #[error("잘못된 URL: {0}")]
    InvalidUrl(String),

    /// 프레임 디코딩/인코딩 실패
    #[error("프로토콜 에러: {0}")]
    Protocol(String),
}

impl StreamError {
    /// 백오프 후 재연결로 복구 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Transport(_) | StreamError::Timeout(_))
    }

    /// 재시도해도 같은 결과인 에러인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::TransportSecurity(_) | StreamError::InvalidUrl(_) | StreamError::Destroyed
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Protocol(err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        StreamError::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

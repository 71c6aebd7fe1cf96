//! 캔들 데이터 소스.
//!
//! [`KlineSource`]는 심볼/타임프레임별 캔들을 가져오는 비동기 인터페이스입니다.
//! 실제 REST 클라이언트와 캐시 래퍼, 테스트용 가짜 소스가 모두 이 trait을 구현합니다.

mod cached;
mod rest;

pub use cached::CachedKlineSource;
pub use rest::RestKlineClient;

use async_trait::async_trait;
use market_core::{Kline, Timeframe};
use serde::Serialize;

use crate::error::Result;

/// 캔들 요청 파라미터.
///
/// 직렬화 결과가 캐시 키의 일부가 되므로 필드 순서를 바꾸지 마세요.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KlineRequest {
    /// 심볼 (예: "BTCUSDT")
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 최대 캔들 수
    pub limit: usize,
    /// 이 시각(포함) 이전의 캔들만 요청 (역방향 페이징 커서, Unix 밀리초)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
    /// 이 시각 이후의 캔들만 요청 (Unix 밀리초)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<i64>,
}

impl KlineRequest {
    /// 최신 캔들 요청을 생성합니다.
    pub fn latest(symbol: impl Into<String>, timeframe: Timeframe, limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            limit,
            cursor: None,
            as_of: None,
        }
    }

    /// 커서를 지정합니다.
    pub fn before(mut self, cursor: i64) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// 시작 시각을 지정합니다.
    pub fn since(mut self, as_of: i64) -> Self {
        self.as_of = Some(as_of);
        self
    }
}

/// 캔들 데이터 소스.
///
/// 반환되는 시계열은 시간 오름차순이며 타임스탬프가 중복되지 않아야 합니다.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// 소스 이름 (로깅 및 캐시 키용).
    fn name(&self) -> &str;

    /// 캔들을 가져옵니다.
    async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<Kline>>;
}

#[async_trait]
impl<S: KlineSource + ?Sized> KlineSource for std::sync::Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<Kline>> {
        (**self).fetch_klines(request).await
    }
}

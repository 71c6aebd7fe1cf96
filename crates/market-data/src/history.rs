//! 과거 캔들 역방향 페이징.
//!
//! 가장 오래된 캔들 직전을 커서로 삼아 목표 길이에 도달할 때까지 이전 페이지를 요청합니다.
//! 페이지가 비었거나, 더 오래된 데이터가 나오지 않거나, 반복 한도에 도달하면 멈춥니다.

use std::time::Duration;

use market_core::{merge_klines, with_retry, BackoffPolicy, Kline};
use tracing::{debug, info, warn};

use crate::error::{DataError, Result};
use crate::provider::{KlineRequest, KlineSource};

/// 백필 설정.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// 최대 페이지 요청 수
    pub max_iterations: usize,
    /// 페이지당 요청할 캔들 수
    pub page_limit: usize,
    /// 페이지 사이의 대기 시간
    pub courtesy_delay: Duration,
    /// 페이지당 최대 시도 횟수 (첫 시도 포함)
    pub max_attempts: u32,
    /// 재시도 백오프
    pub backoff: BackoffPolicy,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            page_limit: 1_000,
            courtesy_delay: Duration::from_millis(100),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// 백필 결과 통계.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillStats {
    /// 요청한 페이지 수
    pub pages: usize,
    /// 새로 추가된 캔들 수
    pub added: usize,
    /// 최종 시계열 길이
    pub total: usize,
    /// 목표 길이 도달 여부
    pub reached_target: bool,
}

/// `existing` 앞쪽으로 과거 캔들을 채웁니다.
///
/// `existing`이 비어 있으면 `request.cursor` (없으면 최신)부터 시작합니다.
/// 실패한 페이지는 재시도 후에도 실패하면 에러를 반환하며, 그때까지 병합된 캔들은 `existing`에 남습니다.
pub async fn backfill_history<S>(
    source: &S,
    request: &KlineRequest,
    existing: &mut Vec<Kline>,
    target_len: usize,
    config: &BackfillConfig,
) -> Result<BackfillStats>
where
    S: KlineSource + ?Sized,
{
    if config.page_limit == 0 {
        return Err(DataError::InvalidRequest(
            "page_limit은 1 이상이어야 합니다".to_string(),
        ));
    }

    let mut stats = BackfillStats::default();
    let mut cursor = existing.first().map(|k| k.time - 1).or(request.cursor);

    while existing.len() < target_len && stats.pages < config.max_iterations {
        let mut page_request = request.clone();
        page_request.limit = config.page_limit.min(target_len - existing.len()).max(1);
        page_request.cursor = cursor;

        if stats.pages > 0 && !config.courtesy_delay.is_zero() {
            tokio::time::sleep(config.courtesy_delay).await;
        }

        let page = with_retry(
            &config.backoff,
            config.max_attempts,
            DataError::is_retryable,
            || source.fetch_klines(&page_request),
        )
        .await?;
        stats.pages += 1;

        let Some(oldest) = page.first().map(|k| k.time) else {
            debug!(symbol = %request.symbol, pages = stats.pages, "빈 페이지, 백필 종료");
            break;
        };

        let added = merge_klines(existing, &page);
        stats.added += added;

        if added == 0 || cursor.is_some_and(|c| oldest > c) {
            warn!(
                symbol = %request.symbol,
                oldest,
                "더 오래된 캔들이 없음, 백필 종료"
            );
            break;
        }
        cursor = existing.first().map(|k| k.time - 1);
    }

    stats.total = existing.len();
    stats.reached_target = existing.len() >= target_len;
    info!(
        symbol = %request.symbol,
        timeframe = %request.timeframe,
        pages = stats.pages,
        added = stats.added,
        total = stats.total,
        "캔들 백필 완료"
    );
    Ok(stats)
}

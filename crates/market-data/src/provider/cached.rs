//! 캐시를 거치는 캔들 소스.

use std::sync::Arc;

use async_trait::async_trait;
use market_core::Kline;
use secrecy::SecretString;
use tracing::debug;

use super::{KlineRequest, KlineSource};
use crate::cache::{CacheKey, CacheLookup, CacheStats, RequestCoalescingCache};
use crate::error::Result;

/// [`RequestCoalescingCache`]로 감싼 캔들 소스.
///
/// 같은 요청이 동시에 들어오면 업스트림 호출은 한 번만 일어납니다.
/// 한도 초과 시 만료된 캐시 값이 있으면 그 값을 반환합니다.
pub struct CachedKlineSource<S> {
    inner: Arc<S>,
    cache: RequestCoalescingCache<Arc<Vec<Kline>>>,
    plan: Option<String>,
    credential: Option<SecretString>,
}

impl<S> CachedKlineSource<S>
where
    S: KlineSource + 'static,
{
    /// 새 캐시 소스 생성.
    pub fn new(inner: Arc<S>, cache: RequestCoalescingCache<Arc<Vec<Kline>>>) -> Self {
        Self {
            inner,
            cache,
            plan: None,
            credential: None,
        }
    }

    /// 요금제 이름을 설정합니다.
    pub fn with_plan(mut self, plan: Option<String>) -> Self {
        self.plan = plan;
        self
    }

    /// 키 범위 구분에 쓸 자격 증명을 설정합니다.
    pub fn with_credential(mut self, credential: SecretString) -> Self {
        self.credential = Some(credential);
        self
    }

    /// 내부 소스.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// 캐시 통계.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// 요청의 캐시 키.
    pub fn key_for(&self, request: &KlineRequest) -> Result<String> {
        CacheKey::compose(
            self.inner.name(),
            request,
            self.plan.as_deref(),
            self.credential.as_ref(),
        )
    }

    /// 신선도 정보를 포함해 캔들을 조회합니다.
    pub async fn lookup(&self, request: &KlineRequest) -> Result<CacheLookup<Arc<Vec<Kline>>>> {
        let key = self.key_for(request)?;
        let inner = Arc::clone(&self.inner);
        let owned = request.clone();

        let lookup = self
            .cache
            .fetch_or_load(&key, move || async move {
                inner.fetch_klines(&owned).await.map(Arc::new)
            })
            .await?;

        if let CacheLookup::Hit(_) = &lookup {
            debug!(key = %key, "캐시 적중");
        }
        Ok(lookup)
    }
}

#[async_trait]
impl<S> KlineSource for CachedKlineSource<S>
where
    S: KlineSource + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<Kline>> {
        let lookup = self.lookup(request).await?;
        Ok(lookup.into_value().as_ref().clone())
    }
}

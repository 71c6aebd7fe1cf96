//! TTL + LRU 요청 병합 캐시.
//!
//! `fetch_or_load` 흐름:
//!
//! ```text
//! 유효 엔트리 있음 ──► 반환 + MRU로 이동
//!    │ 없음
//!    ▼
//! 같은 키 요청 진행 중 ──► 그 결과를 함께 기다림 (업스트림 호출 없음)
//!    │ 없음
//!    ▼
//! loader 시작 → 진행 중 등록 → 완료 시 저장(필요하면 LRU 제거) → 진행 중 해제
//! ```
//!
//! 진행 중 표시는 성공/실패/패닉과 관계없이 반드시 해제됩니다.
//! 한도 초과로 실패했고 만료된 엔트리가 남아 있으면 그 값을 원래 에러와 함께 돌려줍니다.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use market_core::{CacheSettings, PollingSettings};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DataError, Result};

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V>>>;

/// 캐시 설정. 생성 후 변경할 수 없습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// 엔트리 유효 시간
    pub ttl: Duration,
    /// 최대 엔트리 수
    pub max_size: usize,
    /// 만료 후 폴백용으로 보관하는 추가 시간
    pub stale_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            ttl: Duration::from_millis(settings.ttl_ms),
            max_size: settings.max_size.max(1),
            stale_grace: Duration::from_millis(settings.stale_grace_ms),
        }
    }
}

impl CacheConfig {
    /// 실시간 폴링용 설정.
    ///
    /// TTL은 `kline_ttl_ms`와 빠른 폴링 주기의 절반 중 짧은 쪽이라, 폴링 사이클마다
    /// 업스트림을 다시 조회합니다. 동시 요청 병합과 한도 초과 시 만료 값 폴백은 그대로입니다.
    pub fn for_polling(cache: &CacheSettings, polling: &PollingSettings) -> Self {
        let ttl_ms = cache.kline_ttl_ms.min(polling.fast_interval_ms / 2);
        Self {
            ttl: Duration::from_millis(ttl_ms),
            ..Self::from(cache)
        }
    }
}

/// 조회 결과와 그 신선도.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    /// 유효한 캐시 엔트리
    Hit(V),
    /// 업스트림에서 새로 가져옴 (병합된 대기자 포함)
    Loaded(V),
    /// 한도 초과로 만료된 값을 대신 반환. `error`는 로깅용 원래 에러.
    Stale { value: V, error: DataError },
}

impl<V> CacheLookup<V> {
    /// 값을 꺼냅니다.
    pub fn into_value(self) -> V {
        match self {
            CacheLookup::Hit(v) | CacheLookup::Loaded(v) => v,
            CacheLookup::Stale { value, .. } => value,
        }
    }

    /// 값 참조.
    pub fn value(&self) -> &V {
        match self {
            CacheLookup::Hit(v) | CacheLookup::Loaded(v) => v,
            CacheLookup::Stale { value, .. } => value,
        }
    }

    /// 만료된 폴백 값인지 여부.
    pub fn is_stale(&self) -> bool {
        matches!(self, CacheLookup::Stale { .. })
    }
}

/// 캐시 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 유효 엔트리 적중
    pub hits: u64,
    /// loader 실행 횟수
    pub misses: u64,
    /// 진행 중 요청에 합류한 횟수
    pub coalesced: u64,
    /// 만료 값으로 대체 응답한 횟수
    pub stale_served: u64,
    /// LRU 제거 횟수
    pub evictions: u64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Pending<V> {
    generation: u64,
    future: SharedLoad<V>,
}

struct State<V> {
    entries: IndexMap<String, Entry<V>>,
    pending: HashMap<String, Pending<V>>,
    next_generation: u64,
    stats: CacheStats,
}

impl<V: Clone> State<V> {
    /// 유효 엔트리를 찾아 MRU로 이동합니다. 보관 기한이 지난 엔트리는 제거합니다.
    fn live_value(&mut self, key: &str, now: Instant, config: &CacheConfig) -> Option<V> {
        let index = self.entries.get_index_of(key)?;
        let age = now.saturating_duration_since(self.entries[index].inserted_at);

        if age > config.ttl + config.stale_grace {
            self.entries.shift_remove_index(index);
            return None;
        }
        if age > config.ttl {
            return None;
        }

        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        Some(self.entries[last].value.clone())
    }

    fn stale_value(&self, key: &str, now: Instant, config: &CacheConfig) -> Option<V> {
        self.entries.get(key).and_then(|entry| {
            let age = now.saturating_duration_since(entry.inserted_at);
            (age <= config.ttl + config.stale_grace).then(|| entry.value.clone())
        })
    }

    fn store(&mut self, key: String, value: V, now: Instant, max_size: usize) {
        self.entries.shift_remove(&key);
        while self.entries.len() >= max_size {
            match self.entries.shift_remove_index(0) {
                Some((victim, _)) => {
                    self.stats.evictions += 1;
                    debug!(key = %victim, "LRU 엔트리 제거");
                }
                None => break,
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    fn clear_pending(&mut self, key: &str, generation: u64) {
        if self
            .pending
            .get(key)
            .is_some_and(|p| p.generation == generation)
        {
            self.pending.remove(key);
        }
    }
}

/// 로드가 끝나지 못하고 해제될 때(패닉 등) 진행 중 표시를 지웁니다.
struct PendingGuard<V: Clone> {
    state: Arc<Mutex<State<V>>>,
    key: String,
    generation: u64,
    armed: bool,
}

impl<V: Clone> Drop for PendingGuard<V> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().clear_pending(&self.key, self.generation);
        }
    }
}

/// TTL + LRU 요청 병합 캐시.
///
/// 복제본은 같은 저장소를 공유합니다.
pub struct RequestCoalescingCache<V> {
    config: CacheConfig,
    state: Arc<Mutex<State<V>>>,
}

impl<V> Clone for RequestCoalescingCache<V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<V> RequestCoalescingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// 새 캐시를 생성합니다.
    pub fn new(config: CacheConfig) -> Self {
        let config = CacheConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            config,
            state: Arc::new(Mutex::new(State {
                entries: IndexMap::new(),
                pending: HashMap::new(),
                next_generation: 0,
                stats: CacheStats::default(),
            })),
        }
    }

    /// 캐시 설정.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 유효 엔트리를 조회합니다. 적중 시 MRU로 이동합니다.
    pub fn get(&self, key: &str) -> Option<V> {
        self.state
            .lock()
            .live_value(key, Instant::now(), &self.config)
    }

    /// 값을 직접 저장합니다.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.state
            .lock()
            .store(key.into(), value, Instant::now(), self.config.max_size);
    }

    /// 엔트리를 제거합니다. 진행 중 요청에는 영향이 없습니다.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().entries.shift_remove(key).is_some()
    }

    /// 모든 엔트리를 제거합니다.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// 보관 기한(ttl + stale_grace)이 지난 엔트리를 제거하고 개수를 반환합니다.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let keep_for = self.config.ttl + self.config.stale_grace;
        let mut state = self.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= keep_for);
        before - state.entries.len()
    }

    /// 저장된 엔트리 수 (만료되었지만 보관 중인 것 포함).
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// 비어 있는지 여부.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 현재 진행 중인 요청 수.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 통계 스냅샷.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// 캐시를 확인하고 없으면 `loader`로 가져옵니다.
    ///
    /// 같은 키의 요청이 진행 중이면 새 요청을 만들지 않고 그 결과를 기다립니다.
    /// `loader`는 첫 poll 시점에 호출되며 잠금을 잡은 채로 실행되지 않습니다.
    pub async fn fetch_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<CacheLookup<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let mut state = self.state.lock();
            let now = Instant::now();

            if let Some(value) = state.live_value(key, now, &self.config) {
                state.stats.hits += 1;
                return Ok(CacheLookup::Hit(value));
            }

            if let Some(pending) = state.pending.get(key) {
                let future = pending.future.clone();
                state.stats.coalesced += 1;
                debug!(key = %key, "진행 중 요청에 합류");
                future
            } else {
                state.stats.misses += 1;
                let generation = state.next_generation;
                state.next_generation += 1;

                let future = self.load_future(key.to_string(), generation, loader);
                state.pending.insert(
                    key.to_string(),
                    Pending {
                        generation,
                        future: future.clone(),
                    },
                );
                future
            }
        };

        match shared.await {
            Ok(value) => Ok(CacheLookup::Loaded(value)),
            Err(error) if error.is_rate_limited() => {
                let mut state = self.state.lock();
                match state.stale_value(key, Instant::now(), &self.config) {
                    Some(value) => {
                        state.stats.stale_served += 1;
                        warn!(key = %key, error = %error, "요청 한도 초과, 만료된 캐시 데이터 사용");
                        Ok(CacheLookup::Stale { value, error })
                    }
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    fn load_future<F, Fut>(&self, key: String, generation: u64, loader: F) -> SharedLoad<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let max_size = self.config.max_size;

        async move {
            let mut guard = PendingGuard {
                state: Arc::clone(&state),
                key,
                generation,
                armed: true,
            };

            let result = loader().await;

            {
                let mut state = state.lock();
                if let Ok(value) = &result {
                    state.store(guard.key.clone(), value.clone(), Instant::now(), max_size);
                }
                state.clear_pending(&guard.key, generation);
            }
            guard.armed = false;

            if let Err(e) = &result {
                debug!(key = %guard.key, error = %e, "loader 실패, 캐시하지 않음");
            }
            result
        }
        .boxed()
        .shared()
    }
}

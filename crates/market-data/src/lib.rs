//! # Market Data
//!
//! 레이트 리밋이 있는 업스트림 REST API를 보호하는 데이터 계층입니다.
//!
//! - [`cache::RequestCoalescingCache`]: TTL + LRU 캐시, 동일 키 동시 요청 병합
//! - [`cache::CacheKey`]: `{source}:{params}:{plan}:{credential-scope}` 키 구성
//! - [`provider::RestKlineClient`]: 캔들 REST 클라이언트 및 페이로드 검증
//! - [`provider::CachedKlineSource`]: 캐시를 거치는 캔들 소스
//! - [`history::backfill_history`]: 과거 캔들 역방향 페이징

pub mod cache;
pub mod error;
pub mod history;
pub mod provider;

pub use cache::{CacheConfig, CacheKey, CacheLookup, CacheStats, RequestCoalescingCache};
pub use error::{DataError, Result};
pub use history::{backfill_history, BackfillConfig, BackfillStats};
pub use provider::{CachedKlineSource, KlineRequest, KlineSource, RestKlineClient};

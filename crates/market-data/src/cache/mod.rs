//! 요청 병합 캐시.
//!
//! 같은 키에 대한 동시 요청은 하나의 업스트림 호출로 합쳐지고,
//! 결과는 TTL 동안 LRU 정책으로 보관됩니다.

mod coalescing;
mod key;

pub use coalescing::{CacheConfig, CacheLookup, CacheStats, RequestCoalescingCache};
pub use key::CacheKey;

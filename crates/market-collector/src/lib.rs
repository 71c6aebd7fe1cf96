//! 실시간 시세 수집기.
//!
//! 이 crate는 스트림과 폴링을 묶어 지표 업데이트를 만드는 바이너리를 제공합니다:
//! - 적응형 폴링 주기 결정 (화면 숨김, 유휴, 포커스 심볼)
//! - WebSocket 공백을 메우는 REST 폴링 루프
//! - 스트림/폴링 캔들 병합 후 지표 재계산 파이프라인

pub mod error;
pub mod pipeline;
pub mod polling;
pub mod scheduler;
pub mod stats;

pub use error::{CollectorError, Result};
pub use pipeline::{IndicatorUpdate, MarketPipeline, PipelineOptions, UpdateOrigin};
pub use polling::{FeedFreshness, PollTarget, PolledKlines, PollingConfig, PollingLoop};
pub use scheduler::{ActivityState, ActivityTracker, AdaptiveScheduler, SchedulerInput};
pub use stats::CollectionStats;

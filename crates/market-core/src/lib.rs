//! # Market Core
//!
//! 실시간 시세 파이프라인의 핵심 타입과 공통 인프라를 제공합니다.
//!
//! 이 크레이트는 파이프라인 전반에서 사용되는 기본 요소를 담고 있습니다:
//! - 캔들(Kline) 및 타임프레임 정의
//! - 파이프라인 설정 로딩
//! - 로깅 인프라
//! - 지수 백오프 및 재시도 헬퍼

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod types;

pub use self::config::*;
pub use error::*;
pub use logging::*;
pub use retry::{with_retry, BackoffPolicy};
pub use types::*;

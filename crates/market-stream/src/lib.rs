//! # Market Stream
//!
//! 거래소 WebSocket 피드 연결을 관리합니다.
//!
//! - [`ConnectionManager`]: 보안 연결 강제, 백오프 재연결, 하트비트 감시, 구독 복원
//! - [`EventBus`]: (symbol, channel)별 콜백 등록과 격리된 틱 전달
//! - [`FeedCodec`]: 구독/핑 프레임 인코딩과 수신 프레임 디코딩
//! - [`Transport`]: 소켓 계층 추상화 (기본값 [`TungsteniteTransport`])

pub mod codec;
pub mod error;
pub mod event_bus;
pub mod manager;
pub mod state;
pub mod transport;

pub use codec::{FeedCodec, Inbound, JsonFeedCodec, MarketTick};
pub use error::{Result, StreamError};
pub use event_bus::{
    callback, BusChange, CallbackResult, DispatchReport, EventBus, SubscriptionHandle,
    SubscriptionKey, TickCallback,
};
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionMetrics};
pub use state::{ConnectionEvent, ConnectionState, FeedChannel};
pub use transport::{Frame, FrameSink, FrameStream, Transport, TungsteniteTransport};

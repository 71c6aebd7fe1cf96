//! 연결 상태 기계.
//!
//! ```text
//!  Disconnected ──Connect──► Connecting ──HandshakeOk──► Connected
//!       ▲                        │                           │
//!       └────HandshakeFailed─────┘                           │
//!       └──────────────────────Lost──────────────────────────┘
//!
//!  (모든 상태) ──Destroy──► Destroyed   (종료 상태)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// 논리 채널 하나의 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

/// 상태 전이를 일으키는 이벤트.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 연결 시도 시작
    Connect,
    /// 핸드셰이크 성공
    HandshakeOk,
    /// 핸드셰이크 실패 또는 타임아웃
    HandshakeFailed,
    /// 원격 종료 또는 네트워크 에러
    Lost,
    /// 파기
    Destroy,
}

impl ConnectionState {
    /// 이벤트에 따른 다음 상태. 허용되지 않는 전이는 `None`.
    pub fn transition(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Destroyed, _) => None,
            (_, E::Destroy) => Some(S::Destroyed),
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::HandshakeOk) => Some(S::Connected),
            (S::Connecting, E::HandshakeFailed) => Some(S::Disconnected),
            (S::Connected, E::Lost) => Some(S::Disconnected),
            _ => None,
        }
    }

    /// 종료 상태 여부.
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Destroyed
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// 피드 채널 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedChannel {
    /// 공개 시세
    Public,
    /// 개인 계정 이벤트
    Private,
}

impl fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedChannel::Public => write!(f, "public"),
            FeedChannel::Private => write!(f, "private"),
        }
    }
}

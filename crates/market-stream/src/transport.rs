//! WebSocket 전송 계층 추상화.
//!
//! [`ConnectionManager`](crate::ConnectionManager)는 소켓을 직접 다루지 않고
//! [`Transport`]가 돌려준 프레임 싱크/스트림 쌍만 사용합니다.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, StreamError};

/// 전송 프레임.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// 송신 싱크.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = StreamError> + Send>>;

/// 수신 스트림.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// 연결을 여는 전송 계층.
///
/// URL 검증은 호출자가 끝낸 상태로 전달됩니다.
#[async_trait]
pub trait Transport: Send + Sync {
    /// 핸드셰이크를 수행하고 프레임 싱크/스트림을 반환합니다.
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream)>;
}

/// `tokio-tungstenite` 기반 전송 계층 (rustls + webpki 루트).
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(payload) => Message::Ping(payload.into()),
        Frame::Pong(payload) => Message::Pong(payload.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok().map(Frame::Text),
        Message::Ping(payload) => Some(Frame::Ping(payload.to_vec())),
        Message::Pong(payload) => Some(Frame::Pong(payload.to_vec())),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream)> {
        info!("Connecting to WebSocket: {}", url);

        let (ws_stream, response) = connect_async(url.as_str()).await?;
        debug!(status = %response.status(), "WebSocket 핸드셰이크 완료");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(StreamError::from)
            .with(|frame: Frame| future::ready(Ok::<_, StreamError>(to_message(frame))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(StreamError::from(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_message_conversion() {
        assert_eq!(
            from_message(to_message(Frame::Text("hi".to_string()))),
            Some(Frame::Text("hi".to_string()))
        );
        assert_eq!(
            from_message(to_message(Frame::Ping(vec![1, 2]))),
            Some(Frame::Ping(vec![1, 2]))
        );
        assert_eq!(from_message(to_message(Frame::Close)), Some(Frame::Close));
        assert_eq!(
            from_message(Message::Binary(b"{}".to_vec().into())),
            Some(Frame::Text("{}".to_string()))
        );
    }
}

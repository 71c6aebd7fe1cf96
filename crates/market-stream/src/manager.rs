//! WebSocket 연결 관리자.
//!
//! 논리 채널 하나(공개 또는 개인)에 대해 연결, 구독 복원, 하트비트, 백오프 재연결, 파기를 담당합니다.
//!
//! # 생명주기
//!
//! 1. [`ConnectionManager::connect`]: URL 검증 후 세션 태스크 시작. `wss`가 아니면 즉시 거부.
//! 2. 세션 태스크: 연결 → 등록된 키 재구독 → 수신 루프 → 끊기면 백오프 후 1로.
//! 3. [`ConnectionManager::destroy`]: 취소 토큰 발동, 구독 제거, `Destroyed` 전이. 이후 재연결 없음.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use market_core::{BackoffPolicy, BackoffSettings, WebSocketSettings};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::codec::{FeedCodec, Inbound, JsonFeedCodec, MarketTick};
use crate::error::{Result, StreamError};
use crate::event_bus::{
    callback, BusChange, CallbackResult, EventBus, SubscriptionHandle, SubscriptionKey,
};
use crate::state::{ConnectionEvent, ConnectionState, FeedChannel};
use crate::transport::{Frame, FrameSink, FrameStream, Transport, TungsteniteTransport};

/// 연결 설정.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 엔드포인트 (wss 필수)
    pub url: String,
    /// 채널 종류
    pub channel: FeedChannel,
    pub ping_interval: Duration,
    /// 수신이 없을 때 강제 재연결까지의 시간
    pub watchdog_timeout: Duration,
    pub connect_timeout: Duration,
    /// 연속으로 응답 없는 핑 허용 횟수
    pub max_missed_pongs: u32,
    /// 구간 내 디코딩 에러가 이 수에 도달하면 재연결
    pub error_burst_threshold: u32,
    pub error_burst_window: Duration,
    /// 재연결 백오프
    pub backoff: BackoffPolicy,
}

impl ConnectionConfig {
    fn from_settings(
        url: String,
        channel: FeedChannel,
        ws: &WebSocketSettings,
        backoff: &BackoffSettings,
    ) -> Self {
        Self {
            url,
            channel,
            ping_interval: Duration::from_millis(ws.ping_interval_ms),
            watchdog_timeout: Duration::from_millis(ws.watchdog_timeout_ms),
            connect_timeout: Duration::from_millis(ws.connect_timeout_ms),
            max_missed_pongs: ws.max_missed_pongs,
            error_burst_threshold: ws.error_burst_threshold.max(1),
            error_burst_window: Duration::from_millis(ws.error_burst_window_ms),
            backoff: BackoffPolicy::from(backoff),
        }
    }

    /// 공개 시세 채널 설정.
    pub fn public(ws: &WebSocketSettings, backoff: &BackoffSettings) -> Self {
        Self::from_settings(ws.public_url.clone(), FeedChannel::Public, ws, backoff)
    }

    /// 개인 채널 설정.
    pub fn private(ws: &WebSocketSettings, backoff: &BackoffSettings) -> Self {
        Self::from_settings(ws.private_url.clone(), FeedChannel::Private, ws, backoff)
    }
}

/// 연결 지표 스냅샷.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// 핸드셰이크 시도 수
    pub connect_attempts: u64,
    /// 콜백으로 전달된 틱 수
    pub ticks_delivered: u64,
    /// 실패한 콜백 호출 수
    pub callback_failures: u64,
    /// 연결 유실 후 재연결 횟수
    pub reconnects: u64,
    /// 디코딩 실패 프레임 수
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicU64,
    ticks_delivered: AtomicU64,
    reconnects: AtomicU64,
    decode_errors: AtomicU64,
}

/// 세션 종료 사유.
enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// 세션 태스크가 공유하는 상태.
struct Shared {
    config: ConnectionConfig,
    url: Url,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn FeedCodec>,
    bus: EventBus,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    counters: Counters,
}

impl Shared {
    /// 상태를 전이합니다. 허용되지 않는 전이면 `false`.
    fn apply(&self, event: ConnectionEvent) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| match state.transition(event) {
            Some(next) => {
                applied = true;
                let changed = *state != next;
                *state = next;
                changed
            }
            None => false,
        });
        applied
    }

    fn channel(&self) -> FeedChannel {
        self.config.channel
    }
}

/// WebSocket 연결 관리자.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn FeedCodec>,
    bus: EventBus,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    changes: Mutex<Option<mpsc::UnboundedReceiver<BusChange>>>,
    shared: Mutex<Option<Arc<Shared>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// 기본 전송 계층과 JSON 코덱으로 생성합니다.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, Arc::new(TungsteniteTransport), Arc::new(JsonFeedCodec))
    }

    /// 전송 계층과 코덱을 지정해 생성합니다.
    pub fn with_transport(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn FeedCodec>,
    ) -> Self {
        let (bus, changes) = EventBus::new();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            transport,
            codec,
            bus,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            changes: Mutex::new(Some(changes)),
            shared: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// 채널 종류.
    pub fn channel(&self) -> FeedChannel {
        self.config.channel
    }

    /// 현재 상태.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 상태 변경 구독.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 연결 지표.
    pub fn metrics(&self) -> ConnectionMetrics {
        let mut metrics = ConnectionMetrics {
            callback_failures: self.bus.callback_failures(),
            ..Default::default()
        };
        if let Some(shared) = self.shared.lock().as_ref() {
            let c = &shared.counters;
            metrics.connect_attempts = c.connect_attempts.load(Ordering::Relaxed);
            metrics.ticks_delivered = c.ticks_delivered.load(Ordering::Relaxed);
            metrics.reconnects = c.reconnects.load(Ordering::Relaxed);
            metrics.decode_errors = c.decode_errors.load(Ordering::Relaxed);
        }
        metrics
    }

    /// 엔드포인트를 검증합니다. `wss`가 아니면 `TransportSecurity`.
    pub fn validate_url(raw: &str) -> Result<Url> {
        let url = Url::parse(raw)?;
        if url.scheme() != "wss" {
            return Err(StreamError::TransportSecurity(raw.to_string()));
        }
        Ok(url)
    }

    /// 세션 태스크를 시작합니다.
    ///
    /// 보안 연결이 아닌 URL은 소켓을 열기 전에 거부되며 상태는 `Disconnected`로 남습니다.
    /// 이미 시작된 경우 아무 일도 하지 않습니다.
    pub fn connect(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Err(StreamError::Destroyed);
        }

        let url = match Self::validate_url(&self.config.url) {
            Ok(url) => url,
            Err(e) => {
                error!(
                    channel = %self.config.channel,
                    url = %self.config.url,
                    error = %e,
                    "WebSocket 연결 거부"
                );
                return Err(e);
            }
        };

        let Some(changes) = self.changes.lock().take() else {
            debug!(channel = %self.config.channel, "세션이 이미 실행 중");
            return Ok(());
        };

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            url,
            transport: Arc::clone(&self.transport),
            codec: Arc::clone(&self.codec),
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            counters: Counters::default(),
        });
        *self.shared.lock() = Some(Arc::clone(&shared));

        let handle = tokio::spawn(run(shared, changes));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// (symbol, channel)에 콜백을 등록합니다.
    ///
    /// 연결 중이면 첫 구독자일 때 즉시 와이어 구독을 보내고,
    /// 연결 전이거나 재연결 중이면 다음 연결에서 전체 재구독으로 반영됩니다.
    pub fn subscribe<F>(
        &self,
        symbol: impl Into<String>,
        channel: impl Into<String>,
        on_tick: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&MarketTick) -> CallbackResult + Send + Sync + 'static,
    {
        if self.state().is_terminal() {
            return Err(StreamError::Destroyed);
        }
        self.bus
            .subscribe(SubscriptionKey::new(symbol, channel), callback(on_tick))
    }

    /// 활성 구독 키.
    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.bus.keys()
    }

    /// 연결을 파기합니다. 되돌릴 수 없습니다.
    ///
    /// 이후 틱 전달과 재연결 시도는 조용히 무시됩니다.
    pub fn destroy(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.bus.close();
        self.state.send_if_modified(|state| match state.transition(ConnectionEvent::Destroy) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        });
        // 시작되지 않은 세션의 수신기도 정리
        self.changes.lock().take();
        info!(channel = %self.config.channel, "WebSocket 연결 파기");
    }

    /// 세션 태스크 종료를 기다립니다.
    pub async fn wait_stopped(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(channel = %self.config.channel, error = %e, "세션 태스크 비정상 종료");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 재연결 루프.
async fn run(shared: Arc<Shared>, mut changes: mpsc::UnboundedReceiver<BusChange>) {
    let channel = shared.channel();
    let mut attempt: u32 = 0;

    loop {
        if shared.cancel.is_cancelled() || !shared.apply(ConnectionEvent::Connect) {
            break;
        }
        shared.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let opened = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            opened = timeout(shared.config.connect_timeout, shared.transport.open(&shared.url)) => opened,
        };

        match opened {
            Ok(Ok((sink, stream))) => {
                if !shared.apply(ConnectionEvent::HandshakeOk) {
                    break;
                }
                info!(channel = %channel, "WebSocket 연결 성공");
                attempt = 0;

                match session(&shared, sink, stream, &mut changes).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => {
                        warn!(channel = %channel, reason = %reason, "WebSocket 연결 유실");
                        if !shared.apply(ConnectionEvent::Lost) {
                            break;
                        }
                        shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(channel = %channel, error = %e, "WebSocket 핸드셰이크 실패");
                if !shared.apply(ConnectionEvent::HandshakeFailed) {
                    break;
                }
            }
            Err(_) => {
                let e = StreamError::Timeout(shared.config.connect_timeout.as_millis() as u64);
                warn!(channel = %channel, error = %e, "WebSocket 핸드셰이크 실패");
                if !shared.apply(ConnectionEvent::HandshakeFailed) {
                    break;
                }
            }
        }

        let delay = shared.config.backoff.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        info!(
            channel = %channel,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "재연결 대기"
        );

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    debug!(channel = %channel, "세션 태스크 종료");
}

/// 종료 시 닫기 프레임 전송에 허용하는 시간.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 제한 시간 안에 프레임을 보냅니다. 쓰기가 막힌 소켓은 연결 유실로 처리됩니다.
async fn send_frame(
    sink: &mut FrameSink,
    frame: Frame,
    limit: Duration,
) -> std::result::Result<(), String> {
    match timeout(limit, sink.send(frame)).await {
        Ok(sent) => sent.map_err(|e| e.to_string()),
        Err(_) => Err(format!("{}ms 내 전송 실패", limit.as_millis())),
    }
}

async fn send_text(
    sink: &mut FrameSink,
    text: Result<String>,
    limit: Duration,
) -> std::result::Result<(), String> {
    let text = text.map_err(|e| e.to_string())?;
    send_frame(sink, Frame::Text(text), limit).await
}

/// 연결 하나의 수신 루프.
async fn session(
    shared: &Shared,
    mut sink: FrameSink,
    mut stream: FrameStream,
    changes: &mut mpsc::UnboundedReceiver<BusChange>,
) -> SessionEnd {
    let config = &shared.config;
    let channel = shared.channel();
    let write_limit = config.connect_timeout;

    // 끊긴 동안 쌓인 변경은 전체 재구독으로 대체된다
    while changes.try_recv().is_ok() {}

    let keys = shared.bus.keys();
    if !keys.is_empty() {
        if let Err(e) = send_text(&mut sink, shared.codec.encode_subscribe(&keys), write_limit).await {
            return SessionEnd::Lost(format!("재구독 전송 실패: {}", e));
        }
        info!(channel = %channel, count = keys.len(), "구독 복원");
    }

    let period = config.ping_interval.max(Duration::from_millis(1));
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let watchdog = sleep(config.watchdog_timeout);
    tokio::pin!(watchdog);

    let mut missed_pongs: u32 = 0;
    let mut decode_errors: VecDeque<Instant> = VecDeque::new();

    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => {
                let closing = async {
                    let _ = sink.send(Frame::Close).await;
                    let _ = sink.close().await;
                };
                if timeout(CLOSE_TIMEOUT, closing).await.is_err() {
                    debug!(channel = %channel, "닫기 프레임 전송 시간 초과, 소켓 폐기");
                }
                return SessionEnd::Cancelled;
            }

            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("스트림 종료".to_string()),
                };
                watchdog.as_mut().reset(Instant::now() + config.watchdog_timeout);

                match frame {
                    Frame::Text(text) => match shared.codec.decode(&text) {
                        Ok(Inbound::Tick(tick)) => {
                            if shared.cancel.is_cancelled() {
                                return SessionEnd::Cancelled;
                            }
                            let report = shared.bus.dispatch(&tick);
                            shared
                                .counters
                                .ticks_delivered
                                .fetch_add(report.delivered as u64, Ordering::Relaxed);
                        }
                        Ok(Inbound::Pong) => missed_pongs = 0,
                        Ok(Inbound::Ping) => {
                            let pong = shared.codec.encode_pong(Utc::now().timestamp_millis());
                            if let Err(e) = send_text(&mut sink, pong, write_limit).await {
                                return SessionEnd::Lost(e);
                            }
                        }
                        Ok(Inbound::Ack) | Ok(Inbound::Ignored) => {}
                        Err(e) => {
                            shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                            debug!(channel = %channel, error = %e, "프레임 디코딩 실패");

                            let now = Instant::now();
                            decode_errors.push_back(now);
                            while decode_errors
                                .front()
                                .is_some_and(|t| now.duration_since(*t) > config.error_burst_window)
                            {
                                decode_errors.pop_front();
                            }
                            if decode_errors.len() as u32 >= config.error_burst_threshold {
                                return SessionEnd::Lost(format!(
                                    "{}ms 내 디코딩 에러 {}회",
                                    config.error_burst_window.as_millis(),
                                    decode_errors.len()
                                ));
                            }
                        }
                    },
                    Frame::Ping(payload) => {
                        if let Err(e) = send_frame(&mut sink, Frame::Pong(payload), write_limit).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Frame::Pong(_) => missed_pongs = 0,
                    Frame::Close => return SessionEnd::Lost("서버에서 연결 종료".to_string()),
                }
            }

            _ = ping.tick() => {
                if missed_pongs >= config.max_missed_pongs {
                    return SessionEnd::Lost(format!("퐁 {}회 누락", missed_pongs));
                }
                missed_pongs += 1;
                let msg = shared.codec.encode_ping(Utc::now().timestamp_millis());
                if let Err(e) = send_text(&mut sink, msg, write_limit).await {
                    return SessionEnd::Lost(format!("핑 전송 실패: {}", e));
                }
            }

            _ = &mut watchdog => {
                return SessionEnd::Lost(format!(
                    "{}ms 동안 수신 없음",
                    config.watchdog_timeout.as_millis()
                ));
            }

            Some(change) = changes.recv() => {
                let (msg, key) = match &change {
                    BusChange::Added(key) => (shared.codec.encode_subscribe(std::slice::from_ref(key)), key),
                    BusChange::Removed(key) => (shared.codec.encode_unsubscribe(std::slice::from_ref(key)), key),
                };
                debug!(channel = %channel, key = %key, change = ?change, "구독 변경 전송");
                if let Err(e) = send_text(&mut sink, msg, write_limit).await {
                    return SessionEnd::Lost(format!("구독 변경 전송 실패: {}", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    /// 테스트 쪽에서 본 연결 하나.
    struct ServerSide {
        to_client: fmpsc::UnboundedSender<Result<Frame>>,
        from_client: fmpsc::UnboundedReceiver<Frame>,
    }

    impl ServerSide {
        fn send_json(&self, value: Value) {
            self.to_client
                .unbounded_send(Ok(Frame::Text(value.to_string())))
                .unwrap();
        }

        async fn next_json(&mut self) -> Value {
            loop {
                match self.from_client.next().await {
                    Some(Frame::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(_) => continue,
                    None => panic!("client closed"),
                }
            }
        }

        /// 핑은 건너뛰고 다음 비-핑 메시지를 받는다.
        async fn next_non_ping(&mut self) -> Value {
            loop {
                let value = self.next_json().await;
                if value["op"] != "ping" {
                    return value;
                }
            }
        }
    }

    struct MockTransport {
        opens: AtomicUsize,
        fail_first: AtomicUsize,
        connections: tokio::sync::mpsc::UnboundedSender<ServerSide>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self, _url: &Url) -> Result<(FrameSink, FrameStream)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StreamError::Transport("refused".to_string()));
            }

            let (to_client, client_rx) = fmpsc::unbounded();
            let (client_tx, from_client) = fmpsc::unbounded();
            let _ = self.connections.send(ServerSide {
                to_client,
                from_client,
            });

            let sink = client_tx.sink_map_err(|e| StreamError::Transport(e.to_string()));
            Ok((Box::pin(sink), Box::pin(client_rx)))
        }
    }

    fn config(url: &str) -> ConnectionConfig {
        ConnectionConfig {
            url: url.to_string(),
            channel: FeedChannel::Public,
            ping_interval: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(3),
            max_missed_pongs: 3,
            error_burst_threshold: 3,
            error_burst_window: Duration::from_secs(10),
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(5))
                .with_jitter(false),
        }
    }

    fn manager(
        url: &str,
        fail_first: usize,
    ) -> (
        ConnectionManager,
        Arc<MockTransport>,
        tokio::sync::mpsc::UnboundedReceiver<ServerSide>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            opens: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(fail_first),
            connections: tx,
        });
        let manager = ConnectionManager::with_transport(
            config(url),
            transport.clone(),
            Arc::new(JsonFeedCodec),
        );
        (manager, transport, rx)
    }

    fn ticker(symbol: &str) -> Value {
        serde_json::json!({"ch": "ticker", "symbol": symbol, "ts": 1, "data": {"la": "1"}})
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
        while *rx.borrow_and_update() != target {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_insecure_url_is_refused_before_any_socket() {
        let (manager, transport, _rx) = manager("ws://fapi.bitunix.com/public/", 0);

        let err = manager.connect().unwrap_err();
        assert!(matches!(err, StreamError::TransportSecurity(_)));
        assert!(err.is_fatal());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_url_is_rejected() {
        let (manager, transport, _rx) = manager("not a url", 0);
        assert!(matches!(manager.connect(), Err(StreamError::InvalidUrl(_))));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribe_and_deliver() {
        let (manager, _transport, mut conns) = manager("wss://example.test/ws", 0);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _handle = manager
            .subscribe("BTCUSDT", "ticker", move |tick| {
                sink.lock().push(tick.symbol.clone());
                Ok(())
            })
            .unwrap();

        manager.connect().unwrap();
        let mut server = conns.recv().await.unwrap();
        let mut status = manager.status();
        wait_for(&mut status, ConnectionState::Connected).await;

        let sub = server.next_non_ping().await;
        assert_eq!(sub["op"], "subscribe");
        assert_eq!(sub["args"][0]["symbol"], "BTCUSDT");
        assert_eq!(sub["args"][0]["ch"], "ticker");

        server.send_json(ticker("BTCUSDT"));
        server.send_json(ticker("ETHUSDT"));
        server.send_json(ticker("BTCUSDT"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*received.lock(), vec!["BTCUSDT", "BTCUSDT"]);
        assert_eq!(manager.metrics().ticks_delivered, 2);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_callback_does_not_block_siblings() {
        let (manager, _transport, mut conns) = manager("wss://example.test/ws", 0);
        let hits = Arc::new(AtomicUsize::new(0));

        let _a = manager
            .subscribe("BTCUSDT", "ticker", |_| panic!("subscriber bug"))
            .unwrap();
        let _b = manager
            .subscribe("BTCUSDT", "ticker", |_| Err("rejected".into()))
            .unwrap();
        let counter = hits.clone();
        let _c = manager
            .subscribe("BTCUSDT", "ticker", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        manager.connect().unwrap();
        let server = conns.recv().await.unwrap();
        server.send_json(ticker("BTCUSDT"));
        server.send_json(ticker("BTCUSDT"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let metrics = manager.metrics();
        assert_eq!(metrics.callback_failures, 4);
        assert_eq!(metrics.ticks_delivered, 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_survive_reconnect() {
        let (manager, transport, mut conns) = manager("wss://example.test/ws", 0);
        let _eth = manager.subscribe("ETHUSDT", "market_kline_1min", |_| Ok(())).unwrap();
        manager.connect().unwrap();

        let mut first = conns.recv().await.unwrap();
        let _ = first.next_non_ping().await;
        let _btc = manager.subscribe("BTCUSDT", "ticker", |_| Ok(())).unwrap();
        let live = first.next_non_ping().await;
        assert_eq!(live["op"], "subscribe");
        assert_eq!(live["args"][0]["symbol"], "BTCUSDT");

        // 서버가 연결을 끊는다
        first.to_client.unbounded_send(Ok(Frame::Close)).unwrap();

        let mut second = conns.recv().await.unwrap();
        let resub = second.next_non_ping().await;
        assert_eq!(resub["op"], "subscribe");
        let symbols: Vec<&str> = resub["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["symbol"].as_str().unwrap())
            .collect();
        assert_eq!(symbols, vec!["ETHUSDT", "BTCUSDT"]);

        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.metrics().reconnects, 1);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_sends_wire_unsubscribe() {
        let (manager, _transport, mut conns) = manager("wss://example.test/ws", 0);
        manager.connect().unwrap();
        let mut server = conns.recv().await.unwrap();
        let mut status = manager.status();
        wait_for(&mut status, ConnectionState::Connected).await;

        let a = manager.subscribe("BTCUSDT", "depth_book1", |_| Ok(())).unwrap();
        let b = manager.subscribe("BTCUSDT", "depth_book1", |_| Ok(())).unwrap();
        assert_eq!(server.next_non_ping().await["op"], "subscribe");

        assert!(a.unsubscribe());
        assert!(b.unsubscribe());
        let unsub = server.next_non_ping().await;
        assert_eq!(unsub["op"], "unsubscribe");
        assert_eq!(unsub["args"][0]["ch"], "depth_book1");
        assert!(manager.subscriptions().is_empty());
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_backs_off_and_retries() {
        let (manager, transport, mut conns) = manager("wss://example.test/ws", 2);
        manager.connect().unwrap();

        let started = Instant::now();
        let _server = conns.recv().await.unwrap();
        // 500ms + 1000ms 백오프 후 세 번째 시도에서 성공
        assert!(started.elapsed() >= Duration::from_millis(1_500));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
        assert_eq!(manager.metrics().connect_attempts, 3);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_triggers_reconnect() {
        let (manager, transport, mut conns) = manager("wss://example.test/ws", 0);
        manager.connect().unwrap();

        let mut first = conns.recv().await.unwrap();
        // 핑 세 번에 응답하지 않는다
        for _ in 0..3 {
            assert_eq!(first.next_json().await["op"], "ping");
        }
        let _second = conns.recv().await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let (manager, transport, mut conns) = manager("wss://example.test/ws", 0);
        manager.connect().unwrap();
        let mut server = conns.recv().await.unwrap();

        for _ in 0..6 {
            assert_eq!(server.next_json().await["op"], "ping");
            server.send_json(serde_json::json!({"op": "pong", "pong": 1}));
        }
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_burst_forces_reconnect() {
        let (manager, transport, mut conns) = manager("wss://example.test/ws", 0);
        manager.connect().unwrap();
        let first = conns.recv().await.unwrap();

        for _ in 0..3 {
            first
                .to_client
                .unbounded_send(Ok(Frame::Text("garbage".to_string())))
                .unwrap();
        }
        let _second = conns.recv().await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.metrics().decode_errors, 3);
        manager.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_delivery_and_reconnects() {
        let (manager, transport, mut conns) = manager("wss://example.test/ws", 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _h = manager
            .subscribe("BTCUSDT", "ticker", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        manager.connect().unwrap();
        let server = conns.recv().await.unwrap();
        server.send_json(ticker("BTCUSDT"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        manager.destroy();
        assert_eq!(manager.state(), ConnectionState::Destroyed);
        let _ = server.to_client.unbounded_send(Ok(Frame::Text(ticker("BTCUSDT").to_string())));
        drop(server);

        // 한 번의 백오프 구간을 훨씬 넘겨 기다린다
        tokio::time::sleep(Duration::from_secs(30)).await;
        manager.wait_stopped().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert!(manager.subscriptions().is_empty());
        assert!(matches!(manager.connect(), Err(StreamError::Destroyed)));
        assert!(matches!(
            manager.subscribe("BTCUSDT", "ticker", |_| Ok(())),
            Err(StreamError::Destroyed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_during_backoff_cancels_timer() {
        let (manager, transport, _conns) = manager("wss://example.test/ws", usize::MAX);
        manager.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

        manager.destroy();
        manager.wait_stopped().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    /// 쓰기가 끝나지 않는 소켓.
    struct StuckTransport {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StuckTransport {
        async fn open(&self, _url: &Url) -> Result<(FrameSink, FrameStream)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let sink = futures::sink::unfold((), |(), _frame: Frame| {
                futures::future::pending::<Result<()>>()
            });
            Ok((Box::pin(sink), Box::pin(futures::stream::pending())))
        }
    }

    fn stuck_manager() -> (ConnectionManager, Arc<StuckTransport>) {
        let transport = Arc::new(StuckTransport {
            opens: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::with_transport(
            config("wss://example.test/ws"),
            transport.clone(),
            Arc::new(JsonFeedCodec),
        );
        (manager, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_with_blocked_writer_stops_promptly() {
        let (manager, _transport) = stuck_manager();
        manager.connect().unwrap();
        let mut status = manager.status();
        wait_for(&mut status, ConnectionState::Connected).await;

        manager.destroy();
        let stopped = timeout(Duration::from_secs(5), manager.wait_stopped()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_ping_write_forces_reconnect() {
        let (manager, transport) = stuck_manager();
        manager.connect().unwrap();

        // 5초 핑 전송이 3초 쓰기 제한을 넘기면 재연결
        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert!(transport.opens.load(Ordering::SeqCst) >= 2);
        assert!(manager.metrics().reconnects >= 1);

        manager.destroy();
        manager.wait_stopped().await;
    }
}

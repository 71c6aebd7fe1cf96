//! REST 폴링 루프.
//!
//! WebSocket이 주 데이터원이고 폴링은 공백 보충용입니다. 대상의 스트림이 연결되어 있고
//! `stale_gap` 안에 틱이 들어왔다면 그 사이클은 건너뜁니다.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use market_core::{Kline, PollingSettings, Timeframe};
use market_data::{DataError, KlineRequest, KlineSource};
use market_stream::ConnectionState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::scheduler::{ActivityTracker, AdaptiveScheduler};
use crate::stats::CollectionStats;

/// 같은 대상의 실패 로그 최소 간격.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// 폴링 대상 (심볼, 타임프레임).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PollTarget {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl PollTarget {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// 최신 캔들 요청.
    pub fn request(&self, limit: usize) -> KlineRequest {
        KlineRequest::latest(self.symbol.clone(), self.timeframe, limit)
    }

    /// 쉼표로 구분된 심볼 목록을 대상 목록으로 변환합니다.
    pub fn parse_list(symbols: &str, timeframe: Timeframe) -> Result<Vec<Self>> {
        let mut targets: Vec<Self> = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .map(|s| Self::new(s, timeframe))
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            return Err(CollectorError::InvalidTarget(format!(
                "심볼 목록이 비어 있습니다: '{}'",
                symbols
            )));
        }
        Ok(targets)
    }
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// 대상 하나에 대해 새로 받은 캔들.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledKlines {
    pub target: PollTarget,
    pub klines: Vec<Kline>,
}

/// WebSocket 틱 신선도 기록.
///
/// 스트림 콜백이 [`record`](Self::record)를 호출하고 폴링 루프가 [`covers`](Self::covers)로 확인합니다.
#[derive(Debug, Clone)]
pub struct FeedFreshness {
    last_tick: Arc<RwLock<HashMap<PollTarget, Instant>>>,
    stale_gap: Duration,
    status: Option<watch::Receiver<ConnectionState>>,
}

impl FeedFreshness {
    pub fn new(stale_gap: Duration) -> Self {
        Self {
            last_tick: Arc::new(RwLock::new(HashMap::new())),
            stale_gap,
            status: None,
        }
    }

    /// 스트림 연결 상태를 연결합니다. 연결하지 않으면 스트림은 항상 끊긴 것으로 봅니다.
    pub fn with_status(mut self, status: watch::Receiver<ConnectionState>) -> Self {
        self.status = Some(status);
        self
    }

    /// 대상의 틱 수신을 기록합니다.
    pub fn record(&self, target: &PollTarget) {
        let now = Instant::now();
        let mut map = self.last_tick.write();
        match map.get_mut(target) {
            Some(at) => *at = now,
            None => {
                map.insert(target.clone(), now);
            }
        }
    }

    /// 마지막 틱 시각.
    pub fn last_tick(&self, target: &PollTarget) -> Option<Instant> {
        self.last_tick.read().get(target).copied()
    }

    /// 스트림이 연결 상태인지.
    pub fn stream_connected(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_connected())
    }

    /// 스트림이 이 대상을 최신으로 유지하고 있는지.
    pub fn covers(&self, target: &PollTarget) -> bool {
        self.stream_connected()
            && self
                .last_tick(target)
                .is_some_and(|at| at.elapsed() < self.stale_gap)
    }
}

/// 폴링 루프 설정.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// 요청당 제한 시간
    pub fetch_timeout: Duration,
    /// 동시 요청 수
    pub max_concurrent: usize,
    /// 요청당 캔들 수
    pub limit: usize,
    /// 같은 대상의 실패 로그 최소 간격
    pub error_log_interval: Duration,
}

impl From<&PollingSettings> for PollingConfig {
    fn from(settings: &PollingSettings) -> Self {
        Self {
            fetch_timeout: Duration::from_millis(settings.fetch_timeout_ms),
            max_concurrent: settings.max_concurrent_polls.max(1),
            limit: settings.limit.max(1),
            error_log_interval: ERROR_LOG_INTERVAL,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::from(&PollingSettings::default())
    }
}

enum PollOutcome {
    Skipped,
    Fetched(Vec<Kline>),
    Failed(DataError),
}

async fn poll_one(
    source: &dyn KlineSource,
    freshness: &FeedFreshness,
    target: &PollTarget,
    config: &PollingConfig,
) -> PollOutcome {
    if freshness.covers(target) {
        return PollOutcome::Skipped;
    }

    let request = target.request(config.limit);
    match timeout(config.fetch_timeout, source.fetch_klines(&request)).await {
        Ok(Ok(klines)) => PollOutcome::Fetched(klines),
        Ok(Err(e)) => PollOutcome::Failed(e),
        Err(_) => PollOutcome::Failed(DataError::Timeout(format!(
            "{} 폴링이 {}ms를 초과했습니다",
            target,
            config.fetch_timeout.as_millis()
        ))),
    }
}

/// 적응형 폴링 루프.
pub struct PollingLoop {
    source: Arc<dyn KlineSource>,
    targets: Vec<PollTarget>,
    scheduler: AdaptiveScheduler,
    activity: ActivityTracker,
    freshness: FeedFreshness,
    config: PollingConfig,
    sink: mpsc::Sender<PolledKlines>,
    cancel: CancellationToken,
}

impl PollingLoop {
    pub fn new(
        source: Arc<dyn KlineSource>,
        mut targets: Vec<PollTarget>,
        scheduler: AdaptiveScheduler,
        activity: ActivityTracker,
        freshness: FeedFreshness,
        config: PollingConfig,
        sink: mpsc::Sender<PolledKlines>,
    ) -> Self {
        targets.sort();
        targets.dedup();
        Self {
            source,
            targets,
            scheduler,
            activity,
            freshness,
            config,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// 외부 취소 토큰을 사용합니다.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 루프를 멈추는 토큰.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn schedule(&self, target: &PollTarget, from: Instant) -> Instant {
        from + self
            .scheduler
            .next_delay(self.activity.snapshot(&target.symbol))
    }

    /// 취소되거나 결과 수신자가 사라질 때까지 폴링합니다.
    pub async fn run(self) -> CollectionStats {
        let started = Instant::now();
        let mut stats = CollectionStats::new();

        if self.targets.is_empty() {
            warn!("폴링할 대상이 없습니다");
            return stats;
        }
        info!(targets = self.targets.len(), "폴링 루프 시작");

        let mut activity_rx = self.activity.subscribe();
        let mut due: HashMap<PollTarget, Instant> =
            self.targets.iter().map(|t| (t.clone(), started)).collect();
        let mut last_poll: HashMap<PollTarget, Instant> = HashMap::new();
        let mut last_error_log: HashMap<PollTarget, Instant> = HashMap::new();

        'cycle: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            stats.cycles += 1;

            let now = Instant::now();
            let ready: Vec<PollTarget> = self
                .targets
                .iter()
                .filter(|t| due.get(*t).is_some_and(|at| *at <= now))
                .cloned()
                .collect();

            if !ready.is_empty() {
                let source = self.source.as_ref();
                let freshness = &self.freshness;
                let config = &self.config;
                let polls = stream::iter(ready)
                    .map(|target| async move {
                        let outcome = poll_one(source, freshness, &target, config).await;
                        (target, outcome)
                    })
                    .buffer_unordered(config.max_concurrent.max(1))
                    .collect::<Vec<_>>();

                let results = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    results = polls => results,
                };

                for (target, outcome) in results {
                    let finished = Instant::now();
                    last_poll.insert(target.clone(), finished);
                    due.insert(target.clone(), self.schedule(&target, finished));

                    match outcome {
                        PollOutcome::Skipped => {
                            stats.skipped += 1;
                            debug!(poll = %target, "스트림이 최신 상태, 폴링 건너뜀");
                        }
                        PollOutcome::Fetched(klines) if klines.is_empty() => {
                            stats.total += 1;
                            stats.empty += 1;
                            debug!(poll = %target, "데이터 없음");
                        }
                        PollOutcome::Fetched(klines) => {
                            stats.total += 1;
                            stats.success += 1;
                            stats.total_klines += klines.len();
                            debug!(poll = %target, klines = klines.len(), "폴링 완료");

                            let batch = PolledKlines {
                                target: target.clone(),
                                klines,
                            };
                            let delivered = tokio::select! {
                                _ = self.cancel.cancelled() => break 'cycle,
                                sent = self.sink.send(batch) => sent.is_ok(),
                            };
                            if !delivered {
                                warn!("폴링 결과 수신자가 종료되어 루프를 멈춥니다");
                                break 'cycle;
                            }
                        }
                        PollOutcome::Failed(e) => {
                            stats.total += 1;
                            stats.errors += 1;

                            let throttled = last_error_log.get(&target).is_some_and(|at| {
                                finished.duration_since(*at) < self.config.error_log_interval
                            });
                            if throttled {
                                debug!(poll = %target, error = %e, "폴링 실패");
                            } else {
                                warn!(poll = %target, error = %e, "폴링 실패");
                                last_error_log.insert(target, finished);
                            }
                        }
                    }
                }
            }

            let next_due = due
                .values()
                .min()
                .copied()
                .unwrap_or_else(|| Instant::now() + self.scheduler.base_interval());

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(next_due) => {}
                Ok(()) = activity_rx.changed() => {
                    for (target, polled) in &last_poll {
                        due.insert(target.clone(), self.schedule(target, *polled));
                    }
                    debug!("활동 상태 변경, 폴링 일정 재계산");
                }
            }
        }

        stats.elapsed = started.elapsed();
        info!(cycles = stats.cycles, "폴링 루프 종료");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use market_core::{CacheSettings, SchedulerSettings};
    use market_data::{CacheConfig, CachedKlineSource, RequestCoalescingCache};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedSource {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KlineSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_klines(&self, request: &KlineRequest) -> market_data::Result<Vec<Kline>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as i64;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(DataError::Network("connection reset".to_string()));
            }
            Ok(vec![Kline::from_close(
                n * request.timeframe.as_millis(),
                100.0 + n as f64,
            )])
        }
    }

    fn scheduler() -> AdaptiveScheduler {
        let settings = SchedulerSettings {
            max_jitter_ms: 0,
            ..Default::default()
        };
        AdaptiveScheduler::new(&PollingSettings::default(), &settings)
    }

    struct Harness {
        source: Arc<ScriptedSource>,
        activity: ActivityTracker,
        cancel: CancellationToken,
        rx: mpsc::Receiver<PolledKlines>,
        handle: tokio::task::JoinHandle<CollectionStats>,
    }

    fn start(
        source: Arc<ScriptedSource>,
        targets: Vec<PollTarget>,
        freshness: FeedFreshness,
        config: PollingConfig,
        prepare: impl FnOnce(&ActivityTracker),
    ) -> Harness {
        let activity = ActivityTracker::new(Duration::from_secs(60));
        prepare(&activity);
        let (tx, rx) = mpsc::channel(64);
        let polling = PollingLoop::new(
            source.clone(),
            targets,
            scheduler(),
            activity.clone(),
            freshness,
            config,
            tx,
        );
        let cancel = polling.cancel_token();
        let handle = tokio::spawn(polling.run());
        Harness {
            source,
            activity,
            cancel,
            rx,
            handle,
        }
    }

    fn btc() -> PollTarget {
        PollTarget::new("BTCUSDT", Timeframe::M1)
    }

    #[test]
    fn test_parse_target_list() {
        let targets = PollTarget::parse_list(" btcusdt, ETHUSDT ,,BTCUSDT", Timeframe::M5).unwrap();
        assert_eq!(
            targets,
            vec![
                PollTarget::new("BTCUSDT", Timeframe::M5),
                PollTarget::new("ETHUSDT", Timeframe::M5)
            ]
        );
        assert_eq!(targets[0].to_string(), "BTCUSDT@5m");
        assert!(matches!(
            PollTarget::parse_list(" , ", Timeframe::M1),
            Err(CollectorError::InvalidTarget(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_target_and_delivers() {
        let eth = PollTarget::new("ETHUSDT", Timeframe::M1);
        let mut h = start(
            ScriptedSource::new(),
            vec![btc(), eth.clone()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |_| {},
        );

        let mut seen = vec![h.rx.recv().await.unwrap().target, h.rx.recv().await.unwrap().target];
        seen.sort();
        assert_eq!(seen, vec![btc(), eth]);

        h.cancel.cancel();
        let stats = h.handle.await.unwrap();
        assert_eq!(stats.success, 2);
        assert_eq!(stats.total_klines, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cadence_follows_base_interval() {
        let h = start(
            ScriptedSource::new(),
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |_| {},
        );

        // 0, 5, 10, 15, 20초
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        assert_eq!(h.source.calls(), 5);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_tab_slows_polling() {
        let h = start(
            ScriptedSource::new(),
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |activity| activity.set_hidden(true),
        );

        // 0, 10, 20초
        tokio::time::sleep(Duration::from_millis(25_000)).await;
        assert_eq!(h.source.calls(), 3);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_change_takes_effect_next_tick() {
        let h = start(
            ScriptedSource::new(),
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(h.source.calls(), 1);

        // 포커스 → 1초 주기로 즉시 재계산 (1.2초, 2.2초에 폴링)
        h.activity.set_focus(Some("BTCUSDT".to_string()));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.source.calls(), 3);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_stream_suppresses_polling() {
        let (_status_tx, status_rx) = watch::channel(ConnectionState::Connected);
        let freshness = FeedFreshness::new(Duration::from_secs(10)).with_status(status_rx);
        freshness.record(&btc());
        assert!(freshness.covers(&btc()));

        let h = start(
            ScriptedSource::new(),
            vec![btc()],
            freshness,
            PollingConfig::default(),
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(7_000)).await;
        assert_eq!(h.source.calls(), 0);

        // 10초 시점에 공백이 생겨 폴링 재개
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(h.source.calls(), 1);

        h.cancel.cancel();
        let stats = h.handle.await.unwrap();
        assert_eq!(stats.skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_stream_does_not_suppress_polling() {
        let (_status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let freshness = FeedFreshness::new(Duration::from_secs(10)).with_status(status_rx);
        freshness.record(&btc());
        assert!(!freshness.covers(&btc()));

        let mut h = start(
            ScriptedSource::new(),
            vec![btc()],
            freshness,
            PollingConfig::default(),
            |_| {},
        );
        assert!(h.rx.recv().await.is_some());
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_loop_running() {
        let source = ScriptedSource::new();
        source.fail.store(true, Ordering::SeqCst);
        let mut h = start(
            source,
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(h.source.calls(), 3);

        h.source.fail.store(false, Ordering::SeqCst);
        assert!(h.rx.recv().await.is_some());

        h.cancel.cancel();
        let stats = h.handle.await.unwrap();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let config = PollingConfig {
            fetch_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let h = start(
            ScriptedSource::with_delay(Duration::from_secs(60)),
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            config,
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        h.cancel.cancel();
        let stats = h.handle.await.unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.success, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop_promptly() {
        let h = start(
            ScriptedSource::with_delay(Duration::from_secs(5)),
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        h.cancel.cancel();
        let started = Instant::now();
        h.handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_stops_loop() {
        let h = start(
            ScriptedSource::new(),
            vec![btc()],
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            |_| {},
        );
        drop(h.rx);

        let stats = h.handle.await.unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(h.source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_source_delivers_fresh_candles_each_cycle() {
        let inner = ScriptedSource::new();
        let cache = RequestCoalescingCache::new(CacheConfig::for_polling(
            &CacheSettings::default(),
            &PollingSettings::default(),
        ));
        let source: Arc<dyn KlineSource> = Arc::new(CachedKlineSource::new(inner.clone(), cache));

        let activity = ActivityTracker::new(Duration::from_secs(60));
        activity.set_focus(Some("BTCUSDT".to_string()));
        let (tx, mut rx) = mpsc::channel(64);
        let polling = PollingLoop::new(
            source,
            vec![btc()],
            scheduler(),
            activity,
            FeedFreshness::new(Duration::from_secs(10)),
            PollingConfig::default(),
            tx,
        );
        let cancel = polling.cancel_token();
        let handle = tokio::spawn(polling.run());

        // 0..=5초, 1초 주기
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut closes = Vec::new();
        while let Ok(polled) = rx.try_recv() {
            closes.push(polled.klines[0].close);
        }
        assert_eq!(inner.calls(), 6);
        assert_eq!(closes.len(), 6);
        assert!(closes.windows(2).all(|w| w[1] > w[0]), "{:?}", closes);
    }
}

//! 스트림 + 폴링 + 지표 워커 연결.
//!
//! ```text
//! ConnectionManager ──kline 틱──┐
//!                               ├─▶ 시계열 병합 ─▶ IndicatorWorker ─▶ broadcast<IndicatorUpdate>
//! PollingLoop ───────REST 캔들──┘
//! ```
//!
//! 같은 타임스탬프의 캔들은 나중에 도착한 값으로 덮어씁니다. 스트림이 최신이면 폴러는
//! 건너뛰므로 실제로 겹치는 경우는 스트림 공백 직후뿐입니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use market_analytics::{
    IndicatorKind, IndicatorOutput, IndicatorRequest, IndicatorSettings, IndicatorWorker,
};
use market_core::{merge_klines, truncate_front, Kline, PipelineConfig, Timeframe};
use market_data::KlineSource;
use market_stream::{ConnectionManager, ConnectionState, SubscriptionHandle};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::polling::{FeedFreshness, PollTarget, PolledKlines, PollingConfig, PollingLoop};
use crate::scheduler::{ActivityTracker, AdaptiveScheduler};
use crate::stats::CollectionStats;

/// 업데이트 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Stream,
    Poll,
}

/// 지표 재계산 결과.
#[derive(Debug, Clone)]
pub struct IndicatorUpdate {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub origin: UpdateOrigin,
    /// 계산에 사용된 캔들 수
    pub candles: usize,
    /// 마지막 캔들
    pub last: Option<Kline>,
    pub output: Arc<IndicatorOutput>,
}

/// 파이프라인 옵션.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub targets: Vec<PollTarget>,
    pub polling: PollingConfig,
    pub scheduler: AdaptiveScheduler,
    /// 이 시간 동안 틱이 없으면 폴링으로 보충
    pub stale_gap: Duration,
    pub settings: IndicatorSettings,
    pub indicators: Vec<IndicatorKind>,
    /// 대상별 최대 보관 캔들 수
    pub max_history: usize,
    /// broadcast 채널 용량
    pub update_capacity: usize,
}

impl PipelineOptions {
    /// 설정 파일 값으로 옵션을 만듭니다. 모든 지표가 활성화됩니다.
    pub fn from_config(config: &PipelineConfig, targets: Vec<PollTarget>) -> Self {
        Self {
            targets,
            polling: PollingConfig::from(&config.polling),
            scheduler: AdaptiveScheduler::new(&config.polling, &config.scheduler),
            stale_gap: Duration::from_millis(config.polling.stale_gap_ms),
            settings: IndicatorSettings::from(&config.indicators),
            indicators: vec![
                IndicatorKind::Sma,
                IndicatorKind::Ema,
                IndicatorKind::Rsi,
                IndicatorKind::BollingerBands,
            ],
            max_history: config.indicators.max_history.max(1),
            update_capacity: 256,
        }
    }
}

struct Processor {
    worker: IndicatorWorker,
    settings: IndicatorSettings,
    indicators: Vec<IndicatorKind>,
    max_history: usize,
    updates: broadcast::Sender<IndicatorUpdate>,
    series: HashMap<PollTarget, Vec<Kline>>,
}

impl Processor {
    async fn apply(&mut self, batch: PolledKlines, origin: UpdateOrigin) {
        let series = self.series.entry(batch.target.clone()).or_default();
        merge_klines(series, &batch.klines);
        truncate_front(series, self.max_history);

        let request = IndicatorRequest {
            klines: series.clone(),
            settings: self.settings,
            enabled_indicators: self.indicators.clone(),
        };
        let candles = request.klines.len();
        let last = request.klines.last().copied();

        match self.worker.compute(request).await {
            Ok(output) => {
                let update = IndicatorUpdate {
                    symbol: batch.target.symbol,
                    timeframe: batch.target.timeframe,
                    origin,
                    candles,
                    last,
                    output: Arc::new(output),
                };
                if self.updates.send(update).is_err() {
                    debug!("지표 업데이트 구독자 없음");
                }
            }
            Err(e) => {
                warn!(symbol = %batch.target.symbol, error = %e, "지표 재계산 실패");
            }
        }
    }

    async fn run(
        mut self,
        mut ticks: mpsc::UnboundedReceiver<PolledKlines>,
        mut polls: mpsc::Receiver<PolledKlines>,
        cancel: CancellationToken,
    ) -> IndicatorWorker {
        loop {
            let (batch, origin) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(batch) = ticks.recv() => (batch, UpdateOrigin::Stream),
                Some(batch) = polls.recv() => (batch, UpdateOrigin::Poll),
                else => break,
            };
            self.apply(batch, origin).await;
        }
        self.worker
    }
}

/// 실행 중인 시세 파이프라인.
pub struct MarketPipeline {
    connection: Arc<ConnectionManager>,
    activity: ActivityTracker,
    freshness: FeedFreshness,
    updates: broadcast::Sender<IndicatorUpdate>,
    cancel: CancellationToken,
    subscriptions: Vec<SubscriptionHandle>,
    poller: JoinHandle<CollectionStats>,
    processor: JoinHandle<IndicatorWorker>,
}

impl MarketPipeline {
    /// 구독 등록, 연결, 폴러와 처리 태스크를 시작합니다.
    ///
    /// 스트림 URL이 보안 연결이 아니면 아무 태스크도 남기지 않고 실패합니다.
    pub fn start(
        options: PipelineOptions,
        source: Arc<dyn KlineSource>,
        connection: ConnectionManager,
    ) -> Result<Self> {
        if options.targets.is_empty() {
            return Err(CollectorError::InvalidTarget("수집 대상이 없습니다".to_string()));
        }

        let connection = Arc::new(connection);
        let freshness = FeedFreshness::new(options.stale_gap).with_status(connection.status());
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let mut subscriptions = Vec::with_capacity(options.targets.len());
        for target in &options.targets {
            let tx = tick_tx.clone();
            let freshness = freshness.clone();
            let target = target.clone();
            let handle = connection.subscribe(
                target.symbol.clone(),
                target.timeframe.kline_channel(),
                move |tick| {
                    let Some(kline) = tick.kline() else {
                        return Err(format!("{} 캔들 페이로드 파싱 실패", tick.channel).into());
                    };
                    freshness.record(&target);
                    tx.send(PolledKlines {
                        target: target.clone(),
                        klines: vec![kline],
                    })
                    .map_err(|_| "파이프라인 종료".into())
                },
            )?;
            subscriptions.push(handle);
        }
        drop(tick_tx);

        if let Err(e) = connection.connect() {
            connection.destroy();
            return Err(e.into());
        }

        let worker = match IndicatorWorker::spawn() {
            Ok(worker) => worker,
            Err(e) => {
                connection.destroy();
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let activity = ActivityTracker::new(options.scheduler.idle_threshold());
        let (updates, _) = broadcast::channel(options.update_capacity.max(1));
        let (poll_tx, poll_rx) = mpsc::channel(options.targets.len() * 2);

        let poller = PollingLoop::new(
            source,
            options.targets.clone(),
            options.scheduler.clone(),
            activity.clone(),
            freshness.clone(),
            options.polling.clone(),
            poll_tx,
        )
        .with_cancel(cancel.child_token());
        let poller = tokio::spawn(poller.run());

        let processor = Processor {
            worker,
            settings: options.settings,
            indicators: options.indicators.clone(),
            max_history: options.max_history,
            updates: updates.clone(),
            series: HashMap::new(),
        };
        let processor = tokio::spawn(processor.run(tick_rx, poll_rx, cancel.child_token()));

        info!(
            targets = options.targets.len(),
            channel = %connection.channel(),
            "시세 파이프라인 시작"
        );

        Ok(Self {
            connection,
            activity,
            freshness,
            updates,
            cancel,
            subscriptions,
            poller,
            processor,
        })
    }

    /// 지표 업데이트 구독.
    pub fn updates(&self) -> broadcast::Receiver<IndicatorUpdate> {
        self.updates.subscribe()
    }

    /// UI 활동 추적기.
    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn freshness(&self) -> &FeedFreshness {
        &self.freshness
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// 연결을 파기하고 폴러, 처리 태스크, 워커를 순서대로 종료합니다.
    pub async fn shutdown(self) -> CollectionStats {
        info!("시세 파이프라인 종료 중");
        self.connection.destroy();
        self.cancel.cancel();
        drop(self.subscriptions);

        let stats = match self.poller.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "폴링 태스크 비정상 종료");
                CollectionStats::default()
            }
        };

        match self.processor.await {
            Ok(worker) => worker.shutdown().await,
            Err(e) => warn!(error = %e, "처리 태스크 비정상 종료"),
        }
        self.connection.wait_stopped().await;

        info!("시세 파이프라인 종료 완료");
        stats
    }
}

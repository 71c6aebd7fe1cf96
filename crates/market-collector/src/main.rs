//! 실시간 시세 수집기 CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use market_analytics::{
    compute_indicators, IndicatorEngine, IndicatorKind, IndicatorRequest, IndicatorSettings,
};
use market_collector::{IndicatorUpdate, MarketPipeline, PipelineOptions, PollTarget};
use market_core::{init_logging, BackoffPolicy, LogConfig, PipelineConfig, Timeframe};
use market_data::{
    backfill_history, BackfillConfig, CacheConfig, CachedKlineSource, KlineRequest, KlineSource,
    RequestCoalescingCache, RestKlineClient,
};
use market_stream::{ConnectionConfig, ConnectionManager};
use secrecy::SecretString;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "market-collector")]
#[command(about = "Real-time market data pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    /// 로그 레벨 (trace, debug, info, warn, error). 지정하지 않으면 설정 파일 값 사용
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 스트림 + 폴링 파이프라인 실행 (Ctrl-C로 종료)
    Run {
        /// 수집할 심볼 (쉼표로 구분, 예: "BTCUSDT,ETHUSDT")
        #[arg(long)]
        symbols: String,

        /// 타임프레임 (1m, 5m, 1h, ...)
        #[arg(long, default_value = "1m")]
        timeframe: String,

        /// 빠른 주기로 폴링할 포커스 심볼
        #[arg(long)]
        focus: Option<String>,
    },

    /// REST로 한 번 조회하고 지표 요약 출력
    Once {
        #[arg(long)]
        symbol: String,

        #[arg(long, default_value = "1m")]
        timeframe: String,

        /// 조회할 캔들 수 (기본값: polling.limit)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// 과거 캔들을 목표 길이까지 역방향으로 채움
    Backfill {
        #[arg(long)]
        symbol: String,

        #[arg(long, default_value = "1m")]
        timeframe: String,

        /// 목표 캔들 수
        #[arg(long, default_value_t = 5_000)]
        target: usize,
    },
}

const ALL_INDICATORS: [IndicatorKind; 4] = [
    IndicatorKind::Sma,
    IndicatorKind::Ema,
    IndicatorKind::Rsi,
    IndicatorKind::BollingerBands,
];

fn parse_timeframe(raw: &str) -> anyhow::Result<Timeframe> {
    raw.parse::<Timeframe>().map_err(anyhow::Error::msg)
}

/// 캐시를 거치는 REST 소스. `MARKET_API_KEY`가 있으면 캐시 키를 자격 증명별로 분리합니다.
fn cached_source(
    config: &PipelineConfig,
    cache: CacheConfig,
) -> anyhow::Result<Arc<dyn KlineSource>> {
    let client = RestKlineClient::from_settings(&config.polling)?;
    let cache = RequestCoalescingCache::new(cache);
    let mut source =
        CachedKlineSource::new(Arc::new(client), cache).with_plan(config.polling.plan.clone());
    if let Ok(key) = std::env::var("MARKET_API_KEY") {
        source = source.with_credential(SecretString::from(key));
    }
    Ok(Arc::new(source))
}

fn log_update(update: &IndicatorUpdate) {
    let out = &update.output;
    tracing::info!(
        symbol = %update.symbol,
        timeframe = %update.timeframe,
        origin = ?update.origin,
        candles = update.candles,
        close = ?update.last.map(|k| k.close),
        sma = ?out.latest("sma"),
        ema = ?out.latest("ema"),
        rsi = ?out.latest("rsi"),
        bb_upper = ?out.latest("bb_upper"),
        bb_lower = ?out.latest("bb_lower"),
        "지표 업데이트"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("설정 로드 실패: {}", cli.config.display()))?;

    // 로깅 초기화
    let mut log = LogConfig::from_settings(&config.logging);
    if let Some(level) = &cli.log_level {
        log.level = level.clone();
    }
    init_logging(log).map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    tracing::info!(config = %cli.config.display(), "Market Collector 시작");

    match cli.command {
        Commands::Run {
            symbols,
            timeframe,
            focus,
        } => {
            let timeframe = parse_timeframe(&timeframe)?;
            let targets = PollTarget::parse_list(&symbols, timeframe)?;
            let options = PipelineOptions::from_config(&config, targets);
            let connection = ConnectionManager::new(ConnectionConfig::public(
                &config.websocket,
                &config.backoff,
            ));

            // 폴백 폴링용 짧은 TTL 캐시
            let source = cached_source(
                &config,
                CacheConfig::for_polling(&config.cache, &config.polling),
            )?;
            let pipeline = MarketPipeline::start(options, source, connection)?;
            if let Some(symbol) = focus {
                pipeline.activity().set_focus(Some(symbol.trim().to_uppercase()));
            }
            let mut updates = pipeline.updates();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("종료 신호 수신, 파이프라인 종료 중...");
                        break;
                    }
                    update = updates.recv() => match update {
                        Ok(update) => log_update(&update),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "지표 업데이트 수신 지연");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }

            let stats = pipeline.shutdown().await;
            stats.log_summary("폴링");
        }
        Commands::Once {
            symbol,
            timeframe,
            limit,
        } => {
            let timeframe = parse_timeframe(&timeframe)?;
            let symbol = symbol.trim().to_uppercase();
            let request =
                KlineRequest::latest(symbol.clone(), timeframe, limit.unwrap_or(config.polling.limit));

            let source = cached_source(&config, CacheConfig::from(&config.cache))?;
            let klines = source.fetch_klines(&request).await?;

            let mut engine = IndicatorEngine::new();
            let output = compute_indicators(
                &mut engine,
                &IndicatorRequest {
                    klines: klines.clone(),
                    settings: IndicatorSettings::from(&config.indicators),
                    enabled_indicators: ALL_INDICATORS.to_vec(),
                },
            )?;

            let latest: BTreeMap<&str, Option<f64>> = output
                .series
                .keys()
                .map(|name| (name.as_str(), output.latest(name).filter(|v| v.is_finite())))
                .collect();
            let summary = serde_json::json!({
                "symbol": symbol,
                "timeframe": timeframe,
                "candles": klines.len(),
                "last": klines.last(),
                "latest": latest,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Backfill {
            symbol,
            timeframe,
            target,
        } => {
            let timeframe = parse_timeframe(&timeframe)?;
            let symbol = symbol.trim().to_uppercase();
            let client = RestKlineClient::from_settings(&config.polling)?;
            let backfill = BackfillConfig {
                backoff: BackoffPolicy::from(&config.backoff),
                ..Default::default()
            };

            let mut series = Vec::new();
            let request = KlineRequest::latest(symbol.clone(), timeframe, backfill.page_limit);
            let stats = backfill_history(&client, &request, &mut series, target, &backfill).await?;

            let summary = serde_json::json!({
                "symbol": symbol,
                "timeframe": timeframe,
                "pages": stats.pages,
                "added": stats.added,
                "total": stats.total,
                "reached_target": stats.reached_target,
                "first": series.first().and_then(|k| k.open_time()),
                "last": series.last().and_then(|k| k.open_time()),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    tracing::info!("Market Collector 종료");
    Ok(())
}

//! Bitunix 선물 캔들 REST 클라이언트.
//!
//! `GET {base}/api/v1/futures/market/kline` 응답을 검증해 [`Kline`] 시계열로 변환합니다.
//! 응답 행의 필드명은 버전마다 다르므로 여러 별칭을 순서대로 확인합니다.

use std::time::Duration;

use async_trait::async_trait;
use market_core::{normalize_klines, Kline, PollingSettings};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{KlineRequest, KlineSource};
use crate::error::{DataError, Result};

const KLINE_ENDPOINT: &str = "/api/v1/futures/market/kline";
const PROVIDER_NAME: &str = "bitunix";

const OPEN_KEYS: &[&str] = &["open", "o"];
const HIGH_KEYS: &[&str] = &["high", "h"];
const LOW_KEYS: &[&str] = &["low", "l"];
const CLOSE_KEYS: &[&str] = &["close", "c"];
const VOLUME_KEYS: &[&str] = &["vol", "v", "baseVol", "volume"];
const TIME_KEYS: &[&str] = &["time", "id", "ts"];

/// 로그에 남기는 응답 본문 최대 길이 (문자).
const LOG_BODY_PREVIEW: usize = 512;

/// 캔들 REST 클라이언트.
#[derive(Debug, Clone)]
pub struct RestKlineClient {
    base_url: String,
    client: Client,
}

impl RestKlineClient {
    /// 새 클라이언트 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하면 `DataError::Network`를 반환합니다.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataError::Network(format!("HTTP 클라이언트 생성 실패: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// 폴링 설정에서 생성.
    pub fn from_settings(settings: &PollingSettings) -> Result<Self> {
        Self::new(
            settings.rest_base_url.clone(),
            Duration::from_millis(settings.fetch_timeout_ms),
        )
    }

    /// 기본 URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn query(request: &KlineRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("interval", request.timeframe.as_exchange_interval().to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(end) = request.cursor {
            params.push(("endTime", end.to_string()));
        }
        if let Some(start) = request.as_of {
            params.push(("startTime", start.to_string()));
        }
        params
    }

    /// HTTP 상태와 응답 봉투를 검사하고 `data` 배열을 꺼냅니다.
    async fn handle_response(
        &self,
        symbol: &str,
        response: reqwest::Response,
    ) -> Result<Vec<Value>> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1_000);
            warn!(symbol = %symbol, ?retry_after_ms, "업스트림 요청 한도 초과");
            return Err(DataError::UpstreamRateLimited {
                provider: PROVIDER_NAME.to_string(),
                retry_after_ms,
            });
        }

        let body = response.text().await?;

        if !status.is_success() {
            return Err(DataError::Http {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let envelope: Value = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(LOG_BODY_PREVIEW).collect();
            error!(error = %e, body = %preview, "응답 파싱 실패");
            DataError::SchemaValidation(format!("JSON 파싱 실패: {}", e))
        })?;

        Self::unwrap_envelope(symbol, envelope)
    }

    fn unwrap_envelope(symbol: &str, envelope: Value) -> Result<Vec<Value>> {
        let code_ok = match envelope.get("code") {
            Some(Value::Number(n)) => n.as_i64() == Some(0),
            Some(Value::String(s)) => s == "0",
            None => true,
            _ => false,
        };

        if !code_ok {
            let code = envelope.get("code").map(Value::to_string).unwrap_or_default();
            let msg = envelope
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let symbol_missing =
                code.trim_matches('"') == "2" || msg.to_lowercase().contains("system error");
            if symbol_missing {
                return Err(DataError::SymbolNotFound(symbol.to_string()));
            }
            return Err(DataError::Http {
                status: 200,
                message: format!("code {}: {}", code, msg),
            });
        }

        match envelope {
            Value::Object(mut map) => match map.remove("data") {
                Some(Value::Array(rows)) => Ok(rows),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Err(DataError::SchemaValidation(format!(
                    "data 필드가 배열이 아닙니다: {}",
                    type_name(&other)
                ))),
            },
            Value::Array(rows) => Ok(rows),
            other => Err(DataError::SchemaValidation(format!(
                "응답이 객체가 아닙니다: {}",
                type_name(&other)
            ))),
        }
    }

    /// 응답 행 하나를 캔들로 변환합니다.
    fn parse_row(row: &Value) -> Result<Kline> {
        let field = |keys: &[&str]| -> Result<f64> {
            keys.iter()
                .find_map(|k| row.get(*k).and_then(as_f64))
                .ok_or_else(|| {
                    DataError::SchemaValidation(format!("필드 누락 또는 숫자 아님: {}", keys[0]))
                })
        };

        let time = field(TIME_KEYS)? as i64;
        let volume = VOLUME_KEYS
            .iter()
            .find_map(|k| row.get(*k).and_then(as_f64))
            .unwrap_or(0.0);

        let kline = Kline::new(
            time,
            field(OPEN_KEYS)?,
            field(HIGH_KEYS)?,
            field(LOW_KEYS)?,
            field(CLOSE_KEYS)?,
            volume,
        );

        if !kline.is_valid() {
            return Err(DataError::SchemaValidation(format!(
                "유효하지 않은 캔들: {:?}",
                kline
            )));
        }
        Ok(kline)
    }

    /// 응답 행 목록을 정렬/중복 제거된 시계열로 변환합니다.
    pub fn parse_rows(rows: &[Value]) -> Result<Vec<Kline>> {
        let mut klines = rows
            .iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;
        normalize_klines(&mut klines);
        Ok(klines)
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl KlineSource for RestKlineClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<Kline>> {
        if request.symbol.is_empty() {
            return Err(DataError::InvalidRequest("심볼이 비어 있습니다".to_string()));
        }
        if request.limit == 0 {
            return Err(DataError::InvalidRequest("limit은 1 이상이어야 합니다".to_string()));
        }

        let url = format!("{}{}", self.base_url, KLINE_ENDPOINT);
        let params = Self::query(request);
        debug!(symbol = %request.symbol, timeframe = %request.timeframe, "GET {}", url);

        let response = self.client.get(&url).query(&params).send().await?;
        let rows = self.handle_response(&request.symbol, response).await?;
        let klines = Self::parse_rows(&rows)?;

        debug!(
            symbol = %request.symbol,
            count = klines.len(),
            "캔들 수신"
        );
        Ok(klines)
    }
}

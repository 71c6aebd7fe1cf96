//! 피드 와이어 프로토콜.
//!
//! 송신:
//! - 구독: `{"op":"subscribe","args":[{"symbol":"BTCUSDT","ch":"ticker"}]}`
//! - 해지: `{"op":"unsubscribe","args":[...]}`
//! - 핑: `{"op":"ping","ping":<unix 초>}`
//!
//! 수신:
//! - 틱: `{"ch":"ticker","symbol":"BTCUSDT","ts":1700000000000,"data":{...}}`
//! - 퐁: `{"op":"pong",...}` 또는 `{"pong":...}`
//! - 응답: `{"op":"subscribe"|"connect"|"login",...}`

use market_core::{Kline, Timeframe};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, StreamError};
use crate::event_bus::SubscriptionKey;

/// 수신한 시세 틱.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    /// 심볼 (개인 채널은 빈 문자열일 수 있음)
    pub symbol: String,
    /// 채널명 (예: `ticker`, `market_kline_1min`)
    pub channel: String,
    /// 서버 타임스탬프 (Unix 밀리초, 없으면 0)
    pub ts: i64,
    /// 채널별 원본 페이로드
    pub data: Value,
}

impl MarketTick {
    /// 구독 키.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol.clone(), self.channel.clone())
    }

    /// 캔들 채널이면 타임프레임을 반환합니다.
    pub fn timeframe(&self) -> Option<Timeframe> {
        Timeframe::from_kline_channel(&self.channel)
    }

    /// 캔들 페이로드를 파싱합니다.
    ///
    /// 시간 필드가 없으면 틱 타임스탬프를 사용합니다. 구조가 맞지 않으면 `None`.
    pub fn kline(&self) -> Option<Kline> {
        self.timeframe()?;
        let data = &self.data;
        let pick = |keys: &[&str]| keys.iter().find_map(|k| data.get(*k).and_then(number));

        let time = pick(&["t", "id", "ts"]).map(|t| t as i64).unwrap_or(self.ts);
        let kline = Kline::new(
            time,
            pick(&["o", "open"])?,
            pick(&["h", "high"])?,
            pick(&["l", "low"])?,
            pick(&["c", "close"])?,
            pick(&["b", "v", "vol"]).unwrap_or(0.0),
        );
        kline.is_valid().then_some(kline)
    }
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v: &f64| v.is_finite())
}

/// 디코딩된 수신 메시지.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// 시세 틱
    Tick(MarketTick),
    /// 핑 응답
    Pong,
    /// 서버 핑 (퐁으로 응답해야 함)
    Ping,
    /// 구독/로그인 응답
    Ack,
    /// 처리 대상이 아닌 메시지
    Ignored,
}

/// 피드 프로토콜 인코더/디코더.
pub trait FeedCodec: Send + Sync {
    /// 구독 요청 프레임.
    fn encode_subscribe(&self, keys: &[SubscriptionKey]) -> Result<String>;

    /// 구독 해지 프레임.
    fn encode_unsubscribe(&self, keys: &[SubscriptionKey]) -> Result<String>;

    /// 애플리케이션 레벨 핑 프레임.
    fn encode_ping(&self, now_ms: i64) -> Result<String>;

    /// 서버 핑에 대한 퐁 프레임.
    fn encode_pong(&self, now_ms: i64) -> Result<String>;

    /// 텍스트 프레임 디코딩. JSON이 아니면 `StreamError::Protocol`.
    fn decode(&self, text: &str) -> Result<Inbound>;
}

/// Bitunix 스타일 JSON 코덱.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFeedCodec;

#[derive(Serialize)]
struct SubscribeArg<'a> {
    symbol: &'a str,
    ch: &'a str,
}

impl JsonFeedCodec {
    fn encode_op(op: &str, keys: &[SubscriptionKey]) -> Result<String> {
        let args: Vec<SubscribeArg<'_>> = keys
            .iter()
            .map(|k| SubscribeArg {
                symbol: &k.symbol,
                ch: &k.channel,
            })
            .collect();
        Ok(serde_json::to_string(&json!({ "op": op, "args": args }))?)
    }
}

impl FeedCodec for JsonFeedCodec {
    fn encode_subscribe(&self, keys: &[SubscriptionKey]) -> Result<String> {
        Self::encode_op("subscribe", keys)
    }

    fn encode_unsubscribe(&self, keys: &[SubscriptionKey]) -> Result<String> {
        Self::encode_op("unsubscribe", keys)
    }

    fn encode_ping(&self, now_ms: i64) -> Result<String> {
        Ok(json!({ "op": "ping", "ping": now_ms / 1_000 }).to_string())
    }

    fn encode_pong(&self, now_ms: i64) -> Result<String> {
        Ok(json!({ "op": "pong", "pong": now_ms / 1_000 }).to_string())
    }

    fn decode(&self, text: &str) -> Result<Inbound> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(StreamError::Protocol("JSON 객체가 아닌 프레임".to_string()));
        };

        match map.get("op").and_then(Value::as_str) {
            Some("pong") => return Ok(Inbound::Pong),
            Some("ping") => return Ok(Inbound::Ping),
            Some(_) if !map.contains_key("ch") => return Ok(Inbound::Ack),
            _ => {}
        }
        if map.contains_key("pong") {
            return Ok(Inbound::Pong);
        }

        let Some(channel) = map.get("ch").and_then(Value::as_str) else {
            return Ok(Inbound::Ignored);
        };
        let data = match map.get("data") {
            Some(Value::Null) | None => {
                return Err(StreamError::Protocol(format!(
                    "{} 채널 메시지에 data가 없습니다",
                    channel
                )))
            }
            Some(data) => data.clone(),
        };

        Ok(Inbound::Tick(MarketTick {
            symbol: map
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            channel: channel.to_string(),
            ts: map.get("ts").and_then(number).map(|t| t as i64).unwrap_or(0),
            data,
        }))
    }
}

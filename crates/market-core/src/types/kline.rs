//! OHLCV 캔들 데이터 구조체.
//!
//! 시계열은 항상 시간 오름차순이며 같은 타임스탬프가 두 번 나타나지 않습니다.
//! REST 폴링과 WebSocket 스트림 양쪽에서 들어온 캔들은 [`merge_klines`]로 합칩니다.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV 캔들스틱 데이터.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// 캔들 시작 시간 (Unix 밀리초)
    pub time: i64,
    /// 시가
    pub open: f64,
    /// 고가
    pub high: f64,
    /// 저가
    pub low: f64,
    /// 종가
    pub close: f64,
    /// 거래량
    pub volume: f64,
}

impl Kline {
    /// 새 캔들을 생성합니다.
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// 종가만 지정한 캔들 (테스트/단순 시계열용).
    pub fn from_close(time: i64, close: f64) -> Self {
        Self::new(time, close, close, close, close, 0.0)
    }

    /// 캔들 시작 시간을 UTC 시각으로 반환합니다.
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.time).single()
    }

    /// 캔들 범위(고가 - 저가)를 반환합니다.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// 구조적으로 유효한 캔들인지 확인합니다.
    ///
    /// 모든 가격이 유한하고, 고가 >= 저가, 시가/종가가 범위 안에 있으며
    /// 거래량이 음수가 아니어야 합니다.
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());

        finite
            && self.time > 0
            && self.high >= self.low
            && self.open <= self.high
            && self.open >= self.low
            && self.close <= self.high
            && self.close >= self.low
            && self.volume >= 0.0
    }
}

/// 종가 시계열을 추출합니다.
pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}

/// 시계열을 정렬하고 중복 타임스탬프를 제거합니다.
///
/// 같은 타임스탬프가 여러 번 있으면 마지막 항목이 남습니다.
pub fn normalize_klines(klines: &mut Vec<Kline>) {
    // 안정 정렬이므로 같은 시간끼리는 입력 순서가 유지된다
    klines.sort_by_key(|k| k.time);
    let mut out: Vec<Kline> = Vec::with_capacity(klines.len());
    for k in klines.drain(..) {
        match out.last_mut() {
            Some(last) if last.time == k.time => *last = k,
            _ => out.push(k),
        }
    }
    *klines = out;
}

/// 기존 시계열에 새 캔들을 병합합니다.
///
/// 같은 타임스탬프는 새 데이터로 덮어씁니다 (진행 중인 캔들 갱신).
/// 새로 추가된 타임스탬프 수를 반환합니다.
pub fn merge_klines(existing: &mut Vec<Kline>, incoming: &[Kline]) -> usize {
    if incoming.is_empty() {
        return 0;
    }

    let before = existing.len();

    // 빠른 경로: 마지막 캔들 갱신 또는 뒤에 이어 붙이기
    if let (Some(last), Some(first_new)) = (existing.last().copied(), incoming.first()) {
        let sorted = incoming.windows(2).all(|w| w[0].time < w[1].time);
        if sorted && first_new.time >= last.time {
            for k in incoming {
                match existing.last_mut() {
                    Some(tail) if tail.time == k.time => *tail = *k,
                    _ => existing.push(*k),
                }
            }
            return existing.len() - before;
        }
    }

    existing.extend_from_slice(incoming);
    normalize_klines(existing);
    existing.len().saturating_sub(before)
}

/// 시계열 앞부분을 잘라 최대 길이를 유지합니다.
pub fn truncate_front(klines: &mut Vec<Kline>, max_len: usize) {
    if klines.len() > max_len {
        let excess = klines.len() - max_len;
        klines.drain(..excess);
    }
}

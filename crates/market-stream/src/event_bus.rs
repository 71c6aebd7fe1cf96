//! 구독 레지스트리와 틱 분배.
//!
//! (심볼, 채널)마다 콜백 목록을 유지합니다. 콜백은 등록 순서대로 호출되며,
//! 한 콜백의 에러나 패닉은 기록만 하고 다음 콜백 호출을 막지 않습니다.
//! 키의 첫 구독자와 마지막 해지자가 생길 때 [`BusChange`]가 제어 채널로 전달됩니다.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::MarketTick;
use crate::error::{Result, StreamError};

/// 콜백 실행 결과.
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// 틱 콜백.
pub type TickCallback = Arc<dyn Fn(&MarketTick) -> CallbackResult + Send + Sync>;

/// 클로저를 [`TickCallback`]으로 감쌉니다.
pub fn callback<F>(f: F) -> TickCallback
where
    F: Fn(&MarketTick) -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 구독 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub channel: String,
}

impl SubscriptionKey {
    pub fn new(symbol: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            channel: channel.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.channel)
    }
}

/// 와이어 구독 상태 변경.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusChange {
    /// 키의 첫 구독자 등록
    Added(SubscriptionKey),
    /// 키의 마지막 구독자 해지
    Removed(SubscriptionKey),
}

/// 분배 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 성공한 콜백 수
    pub delivered: usize,
    /// 에러를 반환했거나 패닉한 콜백 수
    pub failed: usize,
}

struct Registry {
    next_id: u64,
    subscriptions: IndexMap<SubscriptionKey, Vec<(u64, TickCallback)>>,
}

struct BusInner {
    registry: Mutex<Registry>,
    changes: mpsc::UnboundedSender<BusChange>,
    closed: AtomicBool,
    callback_failures: AtomicU64,
}

impl BusInner {
    fn remove(&self, key: &SubscriptionKey, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(callbacks) = registry.subscriptions.get_mut(key) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        let removed = callbacks.len() != before;

        if callbacks.is_empty() {
            registry.subscriptions.shift_remove(key);
            // 알림 순서가 레지스트리 변경 순서와 같도록 잠금 안에서 전송
            if !self.closed.load(Ordering::Acquire) {
                let _ = self.changes.send(BusChange::Removed(key.clone()));
            }
        }
        removed
    }
}

/// 구독 해지 핸들.
///
/// 핸들을 버려도 구독은 유지됩니다. 해지하려면 [`SubscriptionHandle::unsubscribe`]를 호출하세요.
#[must_use = "구독을 해지하려면 핸들이 필요합니다"]
#[derive(Debug)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    id: u64,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    /// 구독 키.
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// 콜백을 해지합니다. 이미 제거되었거나 버스가 없어졌으면 `false`.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&self.key, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// 틱 이벤트 버스.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// 새 버스와 와이어 변경 수신기를 생성합니다.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry {
                    next_id: 0,
                    subscriptions: IndexMap::new(),
                }),
                changes: tx,
                closed: AtomicBool::new(false),
                callback_failures: AtomicU64::new(0),
            }),
        };
        (bus, rx)
    }

    /// 콜백을 등록합니다. 닫힌 버스면 `StreamError::Destroyed`.
    pub fn subscribe(&self, key: SubscriptionKey, callback: TickCallback) -> Result<SubscriptionHandle> {
        let mut registry = self.inner.registry.lock();
        if self.is_closed() {
            return Err(StreamError::Destroyed);
        }

        let id = registry.next_id;
        registry.next_id += 1;

        let callbacks = registry.subscriptions.entry(key.clone()).or_default();
        callbacks.push((id, callback));
        if callbacks.len() == 1 {
            debug!(key = %key, "새 구독 키");
            let _ = self.inner.changes.send(BusChange::Added(key.clone()));
        }
        drop(registry);

        Ok(SubscriptionHandle {
            key,
            id,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// 현재 활성 키 목록 (등록 순서).
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.inner.registry.lock().subscriptions.keys().cloned().collect()
    }

    /// 키의 콜백 수.
    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .registry
            .lock()
            .subscriptions
            .get(key)
            .map_or(0, Vec::len)
    }

    /// 틱을 해당 키의 모든 콜백에 전달합니다.
    ///
    /// 콜백 목록은 잠금 밖에서 호출되므로 콜백 안에서 구독/해지가 가능합니다.
    pub fn dispatch(&self, tick: &MarketTick) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.is_closed() {
            return report;
        }

        let callbacks: Vec<TickCallback> = {
            let registry = self.inner.registry.lock();
            match registry.subscriptions.get(&tick.key()) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return report,
            }
        };

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(tick))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(symbol = %tick.symbol, channel = %tick.channel, error = %e, "콜백 에러");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(symbol = %tick.symbol, channel = %tick.channel, "콜백 패닉");
                }
            }
        }

        if report.failed > 0 {
            self.inner
                .callback_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }

    /// 누적 콜백 실패 수.
    pub fn callback_failures(&self) -> u64 {
        self.inner.callback_failures.load(Ordering::Relaxed)
    }

    /// 버스를 닫고 모든 구독을 제거합니다. 이후 구독과 분배는 무시됩니다.
    pub fn close(&self) {
        let mut registry = self.inner.registry.lock();
        self.inner.closed.store(true, Ordering::Release);
        registry.subscriptions.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

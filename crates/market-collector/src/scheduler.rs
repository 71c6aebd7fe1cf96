//! 적응형 폴링 주기 결정.
//!
//! 화면 표시 여부, 사용자 유휴 여부, 심볼 포커스로 다음 폴링까지의 지연을 정합니다.
//! 폴링 루프는 매 사이클마다 [`AdaptiveScheduler::next_delay`]를 다시 호출합니다.
//!
//! | 조건                      | 지연                          |
//! |---------------------------|-------------------------------|
//! | 화면 숨김                 | `max(hidden_floor, base)`     |
//! | 포커스 심볼 + 활동 중     | `max(fast, fast_floor)`       |
//! | 포커스 심볼 + 유휴        | `active_idle`                 |
//! | 그 외 + 활동 중           | `base + jitter`               |
//! | 그 외 + 유휴              | `2 × base`                    |
//!
//! 결과는 항상 `absolute_floor` 이상입니다.

use std::sync::Arc;
use std::time::Duration;

use market_core::{PollingSettings, SchedulerSettings};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// 스케줄러 입력.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerInput {
    /// 화면(탭)이 숨겨졌는지
    pub hidden: bool,
    /// 사용자가 유휴 상태인지
    pub idle: bool,
    /// 해당 심볼이 사용자 포커스인지
    pub active_symbol: bool,
}

/// 폴링 지연 결정기.
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    base: Duration,
    fast: Duration,
    settings: SchedulerSettings,
}

impl AdaptiveScheduler {
    /// 설정에서 생성합니다. 기본 주기는 2초 미만으로 내려가지 않습니다.
    pub fn new(polling: &PollingSettings, settings: &SchedulerSettings) -> Self {
        Self {
            base: polling.base_interval(),
            fast: Duration::from_millis(polling.fast_interval_ms),
            settings: settings.clone(),
        }
    }

    /// 보정된 기본 주기.
    pub fn base_interval(&self) -> Duration {
        self.base
    }

    /// 유휴 판정 기준.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.settings.idle_threshold_ms)
    }

    /// 지터를 직접 받는 결정 함수.
    ///
    /// `jitter_unit`은 `[0, 1]`로 보정되며 활동 중인 백그라운드 심볼에만 적용됩니다.
    pub fn next_delay_with(&self, input: SchedulerInput, jitter_unit: f64) -> Duration {
        let s = &self.settings;
        let delay = if input.hidden {
            self.base.max(Duration::from_millis(s.hidden_floor_ms))
        } else if input.active_symbol && !input.idle {
            self.fast.max(Duration::from_millis(s.fast_floor_ms))
        } else if input.active_symbol {
            Duration::from_millis(s.active_idle_ms)
        } else if !input.idle {
            let unit = if jitter_unit.is_finite() {
                jitter_unit.clamp(0.0, 1.0)
            } else {
                0.0
            };
            self.base + Duration::from_millis((s.max_jitter_ms as f64 * unit) as u64)
        } else {
            self.base * 2
        };

        delay.max(Duration::from_millis(s.absolute_floor_ms))
    }

    /// 무작위 지터를 적용한 다음 지연.
    pub fn next_delay(&self, input: SchedulerInput) -> Duration {
        let unit = rand::thread_rng().gen_range(0.0..=1.0);
        self.next_delay_with(input, unit)
    }
}

/// 사용자 활동 상태.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityState {
    pub hidden: bool,
    pub last_input: Instant,
    pub focus: Option<String>,
}

/// UI 쪽에서 갱신하는 활동 추적기.
///
/// 복제본은 같은 상태를 공유합니다. 스케줄러 결정에 영향을 주는 변경만 구독자에게 알립니다.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    state: Arc<watch::Sender<ActivityState>>,
    idle_threshold: Duration,
}

impl ActivityTracker {
    pub fn new(idle_threshold: Duration) -> Self {
        let (state, _) = watch::channel(ActivityState {
            hidden: false,
            last_input: Instant::now(),
            focus: None,
        });
        Self {
            state: Arc::new(state),
            idle_threshold,
        }
    }

    /// 화면 표시 여부를 설정합니다.
    pub fn set_hidden(&self, hidden: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.hidden != hidden;
            s.hidden = hidden;
            changed
        });
    }

    /// 사용자 입력을 기록합니다. 유휴 상태에서 벗어날 때만 알림이 발생합니다.
    pub fn record_input(&self) {
        let threshold = self.idle_threshold;
        self.state.send_if_modified(|s| {
            let now = Instant::now();
            let was_idle = now.duration_since(s.last_input) >= threshold;
            s.last_input = now;
            was_idle
        });
    }

    /// 포커스 심볼을 설정합니다.
    pub fn set_focus(&self, symbol: Option<String>) {
        self.state.send_if_modified(|s| {
            let changed = s.focus != symbol;
            s.focus = symbol;
            changed
        });
    }

    /// 현재 유휴 상태인지.
    pub fn is_idle(&self) -> bool {
        self.state.borrow().last_input.elapsed() >= self.idle_threshold
    }

    /// 심볼 하나에 대한 스케줄러 입력.
    pub fn snapshot(&self, symbol: &str) -> SchedulerInput {
        let state = self.state.borrow();
        SchedulerInput {
            hidden: state.hidden,
            idle: state.last_input.elapsed() >= self.idle_threshold,
            active_symbol: state.focus.as_deref() == Some(symbol),
        }
    }

    /// 변경 알림 구독.
    pub fn subscribe(&self) -> watch::Receiver<ActivityState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> AdaptiveScheduler {
        AdaptiveScheduler::new(&PollingSettings::default(), &SchedulerSettings::default())
    }

    fn input(hidden: bool, idle: bool, active_symbol: bool) -> SchedulerInput {
        SchedulerInput {
            hidden,
            idle,
            active_symbol,
        }
    }

    #[test]
    fn test_hidden_takes_precedence() {
        let s = scheduler();
        assert_eq!(
            s.next_delay_with(input(true, false, true), 0.5),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            s.next_delay_with(input(true, true, false), 0.5),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_hidden_respects_larger_base() {
        let polling = PollingSettings {
            base_interval_ms: 30_000,
            ..Default::default()
        };
        let s = AdaptiveScheduler::new(&polling, &SchedulerSettings::default());
        assert_eq!(
            s.next_delay_with(input(true, false, false), 0.0),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_decision_table() {
        let s = scheduler();
        // 포커스 + 활동 중 → 빠른 주기
        assert_eq!(
            s.next_delay_with(input(false, false, true), 1.0),
            Duration::from_millis(1_000)
        );
        // 포커스 + 유휴
        assert_eq!(
            s.next_delay_with(input(false, true, true), 1.0),
            Duration::from_millis(1_000)
        );
        // 백그라운드 + 활동 중 → base + jitter
        assert_eq!(
            s.next_delay_with(input(false, false, false), 0.0),
            Duration::from_millis(5_000)
        );
        assert_eq!(
            s.next_delay_with(input(false, false, false), 1.0),
            Duration::from_millis(5_500)
        );
        // 백그라운드 + 유휴 → 2 × base, 지터 없음
        assert_eq!(
            s.next_delay_with(input(false, true, false), 1.0),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn test_fast_interval_floor_and_base_clamp() {
        let polling = PollingSettings {
            base_interval_ms: 10,
            fast_interval_ms: 5,
            ..Default::default()
        };
        let s = AdaptiveScheduler::new(&polling, &SchedulerSettings::default());
        assert_eq!(s.base_interval(), Duration::from_millis(2_000));
        assert_eq!(
            s.next_delay_with(input(false, false, true), 0.0),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_never_below_absolute_floor() {
        let settings = SchedulerSettings {
            active_idle_ms: 0,
            fast_floor_ms: 0,
            absolute_floor_ms: 250,
            ..Default::default()
        };
        let polling = PollingSettings {
            fast_interval_ms: 0,
            ..Default::default()
        };
        let s = AdaptiveScheduler::new(&polling, &settings);
        for hidden in [false, true] {
            for idle in [false, true] {
                for active in [false, true] {
                    for jitter in [f64::NAN, -1.0, 0.0, 2.0] {
                        let d = s.next_delay_with(input(hidden, idle, active), jitter);
                        assert!(d >= Duration::from_millis(250), "{:?}", d);
                    }
                }
            }
        }
    }

    #[test]
    fn test_random_jitter_is_bounded() {
        let s = scheduler();
        for _ in 0..100 {
            let d = s.next_delay(input(false, false, false));
            assert!(d >= Duration::from_millis(5_000) && d <= Duration::from_millis(5_500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_snapshot_and_idle() {
        let tracker = ActivityTracker::new(Duration::from_secs(60));
        tracker.set_focus(Some("BTCUSDT".to_string()));

        let snap = tracker.snapshot("BTCUSDT");
        assert!(snap.active_symbol && !snap.idle && !snap.hidden);
        assert!(!tracker.snapshot("ETHUSDT").active_symbol);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(tracker.is_idle());
        assert!(tracker.snapshot("BTCUSDT").idle);

        tracker.record_input();
        assert!(!tracker.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_notifies_on_relevant_changes() {
        let tracker = ActivityTracker::new(Duration::from_secs(60));
        let mut rx = tracker.subscribe();
        rx.borrow_and_update();

        // 활동 중 입력은 결정에 영향 없음
        tracker.record_input();
        assert!(!rx.has_changed().unwrap());

        tracker.set_hidden(true);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        tracker.set_hidden(true);
        assert!(!rx.has_changed().unwrap());

        tokio::time::advance(Duration::from_secs(90)).await;
        tracker.record_input();
        assert!(rx.has_changed().unwrap());
    }
}

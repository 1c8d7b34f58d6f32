//! Clock port - 時刻の抽象化
//!
//! - **SystemClock**: 本番用
//! - **ManualClock**: テスト用（任意の時刻に設定・前進できる）

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Clock は現在時刻を提供
///
/// staleness 判定・retry_at・各種タイムスタンプはすべてここから取る。
/// 実際の待機（sleep / timeout）は tokio の時間を使う。
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手動で進める Clock。clone は同じ時刻を共有する。
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        let other = clock.clone();

        clock.advance(chrono::Duration::hours(25));
        assert_eq!(other.now(), t0 + chrono::Duration::hours(25));

        other.set(t0);
        assert_eq!(clock.now(), t0);
    }
}

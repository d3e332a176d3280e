//! 덤프 세션 메트릭
//!
//! 누적 카운터는 원자 변수로 잠금 없이 갱신하고,
//! 초당 처리량 창(window)만 RwLock 으로 보호합니다. 창은 읽을 때 갱신됩니다.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct RateWindow {
    started_at: Instant,
    events_at_start: u64,
    bytes_at_start: u64,
    events_per_second: f64,
    bytes_per_second: f64,
}

/// 세션 하나의 전송 메트릭
#[derive(Debug)]
pub struct DumperMetric {
    interval: Duration,
    events_sent: AtomicU64,
    bytes_sent: AtomicU64,
    fake_rotates: AtomicU64,
    heartbeats: AtomicU64,
    /// 마지막으로 보낸 데이터 이벤트의 타임스탬프 (초, 0 = 없음/따라잡음)
    last_event_ts: AtomicU64,
    window: RwLock<RateWindow>,
}

impl DumperMetric {
    pub fn new(interval: Duration) -> Self {
        DumperMetric {
            interval: interval.max(Duration::from_millis(1)),
            events_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            fake_rotates: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            last_event_ts: AtomicU64::new(0),
            window: RwLock::new(RateWindow {
                started_at: Instant::now(),
                events_at_start: 0,
                bytes_at_start: 0,
                events_per_second: 0.0,
                bytes_per_second: 0.0,
            }),
        }
    }

    pub fn record_send(
        &self,
        event_count: u64,
        byte_count: u64,
        timestamp: u32,
        is_fake_rotate: bool,
        is_heartbeat: bool,
    ) {
        self.events_sent.fetch_add(event_count, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);

        if is_fake_rotate {
            self.fake_rotates.fetch_add(1, Ordering::Relaxed);
        } else if is_heartbeat {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);
        } else if timestamp > 0 {
            self.last_event_ts.store(timestamp as u64, Ordering::Relaxed);
        }
    }

    /// 현재 파일 끝까지 따라잡음: lag 0
    pub fn mark_caught_up(&self) {
        self.last_event_ts.store(0, Ordering::Relaxed);
    }

    pub fn events_per_second(&self) -> f64 {
        self.refresh_window();
        self.window.read().events_per_second
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.refresh_window();
        self.window.read().bytes_per_second
    }

    /// 현재 시각 - 마지막 이벤트 타임스탬프 (초)
    pub fn lag(&self) -> u64 {
        let last = self.last_event_ts.load(Ordering::Relaxed);
        if last == 0 {
            return 0;
        }
        let now = Utc::now().timestamp().max(0) as u64;
        now.saturating_sub(last)
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn fake_rotates(&self) -> u64 {
        self.fake_rotates.load(Ordering::Relaxed)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    fn refresh_window(&self) {
        if self.window.read().started_at.elapsed() < self.interval {
            return;
        }

        let mut window = self.window.write();
        let elapsed = window.started_at.elapsed();
        if elapsed < self.interval {
            // 다른 읽기가 먼저 갱신함
            return;
        }

        let events = self.events_sent();
        let bytes = self.bytes_sent();
        let secs = elapsed.as_secs_f64();
        window.events_per_second = events.saturating_sub(window.events_at_start) as f64 / secs;
        window.bytes_per_second = bytes.saturating_sub(window.bytes_at_start) as f64 / secs;
        window.events_at_start = events;
        window.bytes_at_start = bytes;
        window.started_at = Instant::now();
    }
}

impl Default for DumperMetric {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

//! 전송 속도 제한 (토큰 버킷)
//!
//! 덤프 세션이 이벤트를 보내기 전에 이벤트 수/바이트 수 두 버킷의 허가를 받습니다.
//! 허가가 나지 않으면 이벤트를 버리지 않고 전송 단계만 대기합니다.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 초당 허용량만큼 채워지는 버킷. 용량은 1 초 분량입니다.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        TokenBucket {
            rate: rate as f64,
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }

    /// 용량보다 큰 요청은 버킷이 가득 찼을 때 통과 (잔량이 음수가 됨)
    fn required(&self, cost: f64) -> f64 {
        cost.min(self.rate)
    }

    fn wait_time(&self, cost: f64) -> Duration {
        let deficit = self.required(cost) - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.rate)
        }
    }
}

/// 이벤트/바이트 속도 제한기 (0 = 무제한)
#[derive(Debug)]
pub struct EventRateLimiter {
    events: Option<Mutex<TokenBucket>>,
    bytes: Option<Mutex<TokenBucket>>,
    /// 대기가 필요했던 전송 횟수
    throttled: AtomicU64,
}

impl EventRateLimiter {
    pub fn new(max_events_per_sec: u64, max_bytes_per_sec: u64) -> Self {
        EventRateLimiter {
            events: (max_events_per_sec > 0).then(|| Mutex::new(TokenBucket::new(max_events_per_sec))),
            bytes: (max_bytes_per_sec > 0).then(|| Mutex::new(TokenBucket::new(max_bytes_per_sec))),
            throttled: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.events.is_some() || self.bytes.is_some()
    }

    /// 즉시 허가되면 토큰을 차감하고 None, 아니면 필요한 대기 시간
    pub fn try_acquire(&self, byte_count: u64) -> Option<Duration> {
        let now = Instant::now();
        let mut events = self.events.as_ref().map(|m| m.lock());
        let mut bytes = self.bytes.as_ref().map(|m| m.lock());

        let mut wait = Duration::ZERO;
        if let Some(bucket) = events.as_deref_mut() {
            bucket.refill(now);
            wait = wait.max(bucket.wait_time(1.0));
        }
        if let Some(bucket) = bytes.as_deref_mut() {
            bucket.refill(now);
            wait = wait.max(bucket.wait_time(byte_count as f64));
        }

        if !wait.is_zero() {
            return Some(wait);
        }

        if let Some(bucket) = events.as_deref_mut() {
            bucket.tokens -= 1.0;
        }
        if let Some(bucket) = bytes.as_deref_mut() {
            bucket.tokens -= byte_count as f64;
        }
        None
    }

    /// 허가될 때까지 대기. 대기한 시간을 반환합니다.
    ///
    /// 중단 신호와 함께 기다리려면 호출 측에서 `select!` 로 감쌉니다.
    pub async fn acquire(&self, byte_count: u64) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        let start = Instant::now();
        let mut waited = false;
        while let Some(wait) = self.try_acquire(byte_count) {
            waited = true;
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }

        let elapsed = start.elapsed();
        if waited {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            debug!("Rate limiter: waited {:?} for {} bytes", elapsed, byte_count);
        }
        elapsed
    }

    pub fn throttled_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

impl Default for EventRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_always_admits() {
        let limiter = EventRateLimiter::unlimited();
        assert!(!limiter.is_enabled());
        for _ in 0..10_000 {
            assert!(limiter.try_acquire(1 << 20).is_none());
        }
    }

    #[tokio::test]
    async fn test_event_bucket_denies_after_burst() {
        let limiter = EventRateLimiter::new(5, 0);
        for _ in 0..5 {
            assert!(limiter.try_acquire(100).is_none());
        }
        let wait = limiter.try_acquire(100).unwrap();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_byte_bucket_admits_oversized_event_when_full() {
        let limiter = EventRateLimiter::new(0, 1000);
        // 버킷 용량보다 큰 이벤트도 가득 찬 상태면 통과
        assert!(limiter.try_acquire(5000).is_none());
        // 잔량이 음수라 다음 이벤트는 대기
        assert!(limiter.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn test_acquire_suspends_until_admitted() {
        let limiter = EventRateLimiter::new(100, 0);
        for _ in 0..100 {
            assert!(limiter.try_acquire(0).is_none());
        }
        let waited = limiter.acquire(0).await;
        assert!(waited >= Duration::from_millis(5));
        assert_eq!(limiter.throttled_count(), 1);
    }
}

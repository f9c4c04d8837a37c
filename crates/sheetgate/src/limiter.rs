//! Adaptive per-class token buckets.
//!
//! Each [`OperationClass`] refills at `per_minute / 60` tokens per second up to
//! `burst`. A backend quota error multiplies the refill rate by
//! `throttle_factor` for `cooldown`, after which the rate climbs linearly back
//! to nominal over `restore`. This is the only place the pipeline slows down in
//! response to backend throttling.

use crate::config::RateLimitConfig;
use crate::error::{GateError, Result};
use crate::intent::OperationClass;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    nominal_per_sec: f64,
    last_refill: Instant,
    throttled_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassLimiterStats {
    pub class: OperationClass,
    pub tokens_available: f64,
    pub throttle_multiplier: f64,
    pub nominal_per_minute: f64,
    pub effective_per_minute: f64,
    pub throttle_events: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub read: ClassLimiterStats,
    pub write: ClassLimiterStats,
}

impl RateLimiterStats {
    pub fn class(&self, class: OperationClass) -> &ClassLimiterStats {
        match class {
            OperationClass::Read => &self.read,
            OperationClass::Write => &self.write,
        }
    }

    /// Lowest multiplier across classes (1.0 when nothing is throttled).
    pub fn throttle_multiplier(&self) -> f64 {
        self.read.throttle_multiplier.min(self.write.throttle_multiplier)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: [Mutex<Bucket>; 2],
    throttle_events: [AtomicU64; 2],
    timeouts: [AtomicU64; 2],
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let bucket = |per_minute: u32| {
            Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                capacity: f64::from(config.burst),
                nominal_per_sec: f64::from(per_minute) / 60.0,
                last_refill: now,
                throttled_at: None,
            })
        };
        Self {
            buckets: [
                bucket(config.reads_per_minute),
                bucket(config.writes_per_minute),
            ],
            throttle_events: [AtomicU64::new(0), AtomicU64::new(0)],
            timeouts: [AtomicU64::new(0), AtomicU64::new(0)],
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Current multiplier on the refill rate for `class`.
    pub fn throttle_multiplier(&self, class: OperationClass) -> f64 {
        let mut bucket = self.buckets[class.index()].lock();
        self.multiplier_at(&mut bucket, Instant::now())
    }

    /// Effective refill rate for `class`, in tokens per minute.
    pub fn effective_rate(&self, class: OperationClass) -> f64 {
        let mut bucket = self.buckets[class.index()].lock();
        let m = self.multiplier_at(&mut bucket, Instant::now());
        bucket.nominal_per_sec * 60.0 * m
    }

    fn multiplier_at(&self, bucket: &mut Bucket, now: Instant) -> f64 {
        let Some(at) = bucket.throttled_at else {
            return 1.0;
        };
        let factor = self.config.throttle_factor;
        let elapsed = now.saturating_duration_since(at);
        let cooldown = self.config.cooldown();
        let restore = self.config.restore();
        if elapsed < cooldown {
            return factor;
        }
        let ramp = elapsed - cooldown;
        if ramp < restore {
            return factor + (1.0 - factor) * (ramp.as_secs_f64() / restore.as_secs_f64());
        }
        bucket.throttled_at = None;
        1.0
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let rate = bucket.nominal_per_sec * self.multiplier_at(bucket, now);
        bucket.tokens = (bucket.tokens + rate * elapsed.as_secs_f64()).min(bucket.capacity);
        bucket.last_refill = now;
    }

    /// Take one token without waiting.
    pub fn try_acquire(&self, class: OperationClass) -> bool {
        let mut bucket = self.buckets[class.index()].lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token, failing with `RateLimitTimeout` after the configured timeout.
    pub async fn acquire(&self, class: OperationClass) -> Result<()> {
        self.acquire_within(class, self.config.acquire_timeout()).await
    }

    pub async fn acquire_within(&self, class: OperationClass, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let now = Instant::now();
            let wait = {
                let mut bucket = self.buckets[class.index()].lock();
                self.refill(&mut bucket, now);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                let rate = bucket.nominal_per_sec * self.multiplier_at(&mut bucket, now);
                if rate > 0.0 {
                    Duration::from_secs_f64((1.0 - bucket.tokens) / rate)
                } else {
                    timeout
                }
            };
            if now >= deadline {
                self.timeouts[class.index()].fetch_add(1, Ordering::Relaxed);
                return Err(GateError::RateLimitTimeout {
                    class,
                    waited: now - started,
                });
            }
            // Never sleep past the deadline; the last pass re-checks the bucket.
            let wake = (now + wait.max(Duration::from_millis(1))).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Record a backend quota error for `class` and enter the cool-down.
    pub fn report_throttled(&self, class: OperationClass) {
        let now = Instant::now();
        let mut bucket = self.buckets[class.index()].lock();
        // Settle tokens earned at the old rate first.
        self.refill(&mut bucket, now);
        bucket.throttled_at = Some(now);
        self.throttle_events[class.index()].fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::warn!(
            %class,
            factor = self.config.throttle_factor,
            cooldown_ms = self.config.cooldown_ms,
            "backend throttled; reducing rate"
        );
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let class_stats = |class: OperationClass| {
            let idx = class.index();
            let mut bucket = self.buckets[idx].lock();
            self.refill(&mut bucket, now);
            let m = self.multiplier_at(&mut bucket, now);
            ClassLimiterStats {
                class,
                tokens_available: bucket.tokens,
                throttle_multiplier: m,
                nominal_per_minute: bucket.nominal_per_sec * 60.0,
                effective_per_minute: bucket.nominal_per_sec * 60.0 * m,
                throttle_events: self.throttle_events[idx].load(Ordering::Relaxed),
                timeouts: self.timeouts[idx].load(Ordering::Relaxed),
            }
        };
        RateLimiterStats {
            read: class_stats(OperationClass::Read),
            write: class_stats(OperationClass::Write),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            reads_per_minute: 60,
            writes_per_minute: 60,
            burst: 2,
            acquire_timeout_ms: 500,
            throttle_factor: 0.5,
            cooldown_ms: 10_000,
            restore_ms: 10_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let l = limiter();
        assert!(l.try_acquire(OperationClass::Write));
        assert!(l.try_acquire(OperationClass::Write));
        assert!(!l.try_acquire(OperationClass::Write));
        // Reads have their own bucket.
        assert!(l.try_acquire(OperationClass::Read));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(l.try_acquire(OperationClass::Write));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let l = limiter();
        l.acquire(OperationClass::Write).await.unwrap();
        l.acquire(OperationClass::Write).await.unwrap();
        let before = Instant::now();
        l.acquire_within(OperationClass::Write, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(Instant::now() - before >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_hard() {
        let l = limiter();
        l.acquire(OperationClass::Read).await.unwrap();
        l.acquire(OperationClass::Read).await.unwrap();
        let err = l.acquire(OperationClass::Read).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::RateLimitTimeout {
                class: OperationClass::Read,
                ..
            }
        ));
        assert_eq!(l.stats().read.timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_halves_then_restores_linearly() {
        let l = limiter();
        l.report_throttled(OperationClass::Write);
        assert_eq!(l.effective_rate(OperationClass::Write), 30.0);
        assert_eq!(l.effective_rate(OperationClass::Read), 60.0);

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(l.throttle_multiplier(OperationClass::Write), 0.5);

        tokio::time::advance(Duration::from_millis(5_001)).await;
        let mid = l.throttle_multiplier(OperationClass::Write);
        assert!((mid - 0.75).abs() < 1e-9, "{mid}");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(l.throttle_multiplier(OperationClass::Write), 1.0);
        let stats = l.stats();
        assert_eq!(stats.write.throttle_events, 1);
        assert_eq!(stats.throttle_multiplier(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_throttle_restarts_cooldown() {
        let l = limiter();
        l.report_throttled(OperationClass::Write);
        tokio::time::advance(Duration::from_secs(15)).await;
        l.report_throttled(OperationClass::Write);
        assert_eq!(l.throttle_multiplier(OperationClass::Write), 0.5);
    }
}

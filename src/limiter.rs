//! Admission controller.
//!
//! Four rolling window counters — burst, hourly, daily, plus a minimum
//! spacing between consecutive admissions modeled as a capacity-one window —
//! each reset lazily on the admission check itself. No background timer:
//! when the current time has crossed a counter's boundary the counter drops
//! to zero and a new boundary is set at `now + window`. Admission requires
//! capacity in all counters and increments all of them as one operation
//! under a single lock, so partial increments cannot happen.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RateLimitConfig;

/// Answer from the admission controller. A denial carries the earliest
/// instant a retry can succeed — strictly in the future — so callers
/// schedule one precise wake-up instead of polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied { retry_at: DateTime<Utc> },
}

/// Remaining capacity snapshot, for logs and the operator CLI.
#[derive(Debug, Clone)]
pub struct LimiterStatus {
    pub burst_remaining: u32,
    pub hourly_remaining: u32,
    pub daily_remaining: u32,
    pub next_slot_at: Option<DateTime<Utc>>,
}

struct WindowCounter {
    limit: u32,
    window: chrono::Duration,
    count: u32,
    boundary: DateTime<Utc>,
}

impl WindowCounter {
    fn new(limit: u32, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero()),
            count: 0,
            boundary: now,
        }
    }

    /// Lazy reset: zero the counter once the boundary is crossed.
    fn refresh(&mut self, now: DateTime<Utc>) {
        if now >= self.boundary {
            self.count = 0;
            self.boundary = now + self.window;
        }
    }

    fn has_capacity(&self) -> bool {
        self.count < self.limit
    }

    fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

struct Counters {
    spacing: WindowCounter,
    burst: WindowCounter,
    hourly: WindowCounter,
    daily: WindowCounter,
}

impl Counters {
    fn all_mut(&mut self) -> [&mut WindowCounter; 4] {
        [
            &mut self.spacing,
            &mut self.burst,
            &mut self.hourly,
            &mut self.daily,
        ]
    }
}

/// The admission controller. Owns its counters; nothing else may touch them.
pub struct RateLimiter {
    inner: Mutex<Counters>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let now = Utc::now();
        Self {
            inner: Mutex::new(Counters {
                spacing: WindowCounter::new(1, config.upload_delay, now),
                burst: WindowCounter::new(config.burst_limit, config.burst_window, now),
                hourly: WindowCounter::new(config.hourly_limit, Duration::from_secs(3600), now),
                daily: WindowCounter::new(config.daily_limit, Duration::from_secs(86_400), now),
            }),
        }
    }

    /// May one unit of work proceed now?
    ///
    /// Admission increments every counter or none of them. Denial reports
    /// the latest reset among the exhausted counters — the binding
    /// constraint — and re-checking before that instant will deny again.
    pub fn try_admit(&self) -> Admission {
        self.try_admit_at(Utc::now())
    }

    pub(crate) fn try_admit_at(&self, now: DateTime<Utc>) -> Admission {
        let mut counters = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut retry_at: Option<DateTime<Utc>> = None;
        for counter in counters.all_mut() {
            counter.refresh(now);
            if !counter.has_capacity() {
                retry_at = Some(match retry_at {
                    Some(t) => t.max(counter.boundary),
                    None => counter.boundary,
                });
            }
        }

        if let Some(retry_at) = retry_at {
            return Admission::Denied { retry_at };
        }

        for counter in counters.all_mut() {
            counter.count += 1;
        }
        Admission::Admitted
    }

    pub fn status(&self) -> LimiterStatus {
        let mut counters = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        for counter in counters.all_mut() {
            counter.refresh(now);
        }
        let next_slot_at = counters
            .all_mut()
            .into_iter()
            .filter(|c| !c.has_capacity())
            .map(|c| c.boundary)
            .max();
        LimiterStatus {
            burst_remaining: counters.burst.remaining(),
            hourly_remaining: counters.hourly.remaining(),
            daily_remaining: counters.daily.remaining(),
            next_slot_at,
        }
    }
}

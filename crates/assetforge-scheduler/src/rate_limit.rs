//! Per-owner submission rate limiting.
//!
//! Counters live in process memory, keyed by owner, over fixed calendar
//! windows: the current minute, hour and day. A submission is admitted and
//! counted in one step under the owner's map entry, so two racing
//! submissions cannot both take the last slot.

use assetforge_config::RateLimitConfig;
use assetforge_core::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    Minute,
    Hour,
    Day,
}

impl Span {
    const ALL: [Span; 3] = [Span::Minute, Span::Hour, Span::Day];

    fn seconds(self) -> i64 {
        match self {
            Span::Minute => 60,
            Span::Hour => 3600,
            Span::Day => 86_400,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Span::Minute => "minute",
            Span::Hour => "hour",
            Span::Day => "day",
        }
    }

    /// Index of the window containing `now`.
    fn bucket(self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.seconds())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    bucket: i64,
    count: u32,
}

impl Window {
    fn current(&mut self, bucket: i64) -> &mut u32 {
        if self.bucket != bucket {
            self.bucket = bucket;
            self.count = 0;
        }
        &mut self.count
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SubmissionCounter {
    windows: [Window; 3],
}

/// Fixed-window limits on how often one owner may submit.
#[derive(Debug)]
pub struct SubmissionLimiter {
    limits: RateLimitConfig,
    counters: DashMap<String, SubmissionCounter>,
}

impl SubmissionLimiter {
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            limits,
            counters: DashMap::new(),
        }
    }

    fn limit(&self, span: Span) -> u32 {
        match span {
            Span::Minute => self.limits.per_minute,
            Span::Hour => self.limits.per_hour,
            Span::Day => self.limits.per_day,
        }
    }

    /// Count one submission for `owner_id`, or refuse it if any window is
    /// already at its limit. A refused submission is not counted.
    pub fn admit(&self, owner_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self.counters.entry(owner_id.to_string()).or_default();
        let counter = entry.value_mut();

        for (span, window) in Span::ALL.into_iter().zip(counter.windows.iter_mut()) {
            if *window.current(span.bucket(now)) >= self.limit(span) {
                return Err(Error::RateLimited(format!(
                    "too many requests per {}",
                    span.name()
                )));
            }
        }
        for (span, window) in Span::ALL.into_iter().zip(counter.windows.iter_mut()) {
            *window.current(span.bucket(now)) += 1;
        }
        Ok(())
    }

    /// Give back a slot taken by [`admit`](Self::admit) for a submission
    /// that was not stored after all.
    pub fn refund(&self, owner_id: &str, now: DateTime<Utc>) {
        if let Some(mut entry) = self.counters.get_mut(owner_id) {
            for (span, window) in Span::ALL.into_iter().zip(entry.windows.iter_mut()) {
                let count = window.current(span.bucket(now));
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Refuse when `processing` already reaches the concurrent limit.
    pub fn check_concurrent(&self, processing: u64) -> Result<()> {
        if processing >= u64::from(self.limits.concurrent) {
            return Err(Error::RateLimited(format!(
                "too many concurrent jobs ({} processing)",
                processing
            )));
        }
        Ok(())
    }

    /// Submissions counted against `owner_id` in the current minute.
    #[cfg(test)]
    pub(crate) fn usage(&self, owner_id: &str, now: DateTime<Utc>) -> u32 {
        self.counters
            .get(owner_id)
            .map(|c| {
                let w = c.windows[0];
                if w.bucket == Span::Minute.bucket(now) { w.count } else { 0 }
            })
            .unwrap_or(0)
    }

    /// Forget owners whose day window has passed. Returns the number removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let today = Span::Day.bucket(now);
        let before = self.counters.len();
        self.counters.retain(|_, c| c.windows[2].bucket >= today);
        let removed = before - self.counters.len();
        if removed > 0 {
            debug!(removed, "Pruned idle rate-limit counters");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter(per_minute: u32, per_hour: u32, per_day: u32) -> SubmissionLimiter {
        SubmissionLimiter::new(RateLimitConfig {
            per_minute,
            per_hour,
            per_day,
            concurrent: 3,
        })
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn minute_window_resets_on_the_minute() {
        let limiter = limiter(2, 100, 500);
        limiter.admit("alice", at(10, 0, 1)).unwrap();
        limiter.admit("alice", at(10, 0, 30)).unwrap();
        let err = limiter.admit("alice", at(10, 0, 59)).unwrap_err();
        assert!(matches!(err, Error::RateLimited(msg) if msg.contains("minute")));

        // Other owners have their own counters.
        limiter.admit("bob", at(10, 0, 59)).unwrap();

        limiter.admit("alice", at(10, 1, 0)).unwrap();
        assert_eq!(limiter.usage("alice", at(10, 1, 0)), 1);
    }

    #[test]
    fn hour_limit_spans_minutes() {
        let limiter = limiter(10, 3, 500);
        for minute in 0..3 {
            limiter.admit("alice", at(9, minute, 0)).unwrap();
        }
        let err = limiter.admit("alice", at(9, 59, 0)).unwrap_err();
        assert!(matches!(err, Error::RateLimited(msg) if msg.contains("hour")));
        limiter.admit("alice", at(10, 0, 0)).unwrap();
    }

    #[test]
    fn refused_submission_is_not_counted() {
        let limiter = limiter(1, 100, 500);
        limiter.admit("alice", at(8, 0, 0)).unwrap();
        for _ in 0..5 {
            assert!(limiter.admit("alice", at(8, 0, 10)).is_err());
        }
        assert_eq!(limiter.usage("alice", at(8, 0, 10)), 1);
    }

    #[test]
    fn refund_frees_the_slot() {
        let limiter = limiter(1, 100, 500);
        limiter.admit("alice", at(8, 0, 0)).unwrap();
        limiter.refund("alice", at(8, 0, 5));
        limiter.admit("alice", at(8, 0, 6)).unwrap();
    }

    #[test]
    fn concurrent_limit_counts_processing_jobs() {
        let limiter = limiter(10, 100, 500);
        limiter.check_concurrent(2).unwrap();
        let err = limiter.check_concurrent(3).unwrap_err();
        assert!(matches!(err, Error::RateLimited(msg) if msg.contains("concurrent")));
    }

    #[test]
    fn prune_drops_owners_idle_since_yesterday() {
        let limiter = limiter(10, 100, 500);
        limiter.admit("alice", at(23, 59, 0)).unwrap();
        let tomorrow = at(23, 59, 0) + chrono::Duration::minutes(2);
        limiter.admit("bob", tomorrow).unwrap();

        assert_eq!(limiter.prune(tomorrow), 1);
        assert_eq!(limiter.usage("bob", tomorrow), 1);
        assert_eq!(limiter.prune(tomorrow), 0);
    }
}

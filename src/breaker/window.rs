use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    successes: u64,
    failures: u64,
}

/// Success/failure counts over a sliding window split into fixed buckets.
#[derive(Debug, Clone)]
pub(crate) struct RollingWindow {
    buckets: VecDeque<Bucket>,
    bucket_span: Duration,
    bucket_count: usize,
}

impl RollingWindow {
    pub(crate) fn new(window: Duration, bucket_count: u32) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_span = (window / bucket_count).max(Duration::from_millis(1));
        Self {
            buckets: VecDeque::with_capacity(bucket_count as usize),
            bucket_span,
            bucket_count: bucket_count as usize,
        }
    }

    pub(crate) fn record(&mut self, now: Instant, success: bool) {
        self.prune(now);
        let needs_bucket = self
            .buckets
            .back()
            .map_or(true, |bucket| now >= bucket.started + self.bucket_span);
        if needs_bucket {
            self.buckets.push_back(Bucket {
                started: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
    }

    /// `(calls, failures)` inside the window ending at `now`.
    pub(crate) fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(calls, failures), bucket| {
            (calls + bucket.successes + bucket.failures, failures + bucket.failures)
        })
    }

    pub(crate) fn reset(&mut self) {
        self.buckets.clear();
    }

    fn prune(&mut self, now: Instant) {
        let window = self.bucket_span * self.bucket_count as u32;
        while let Some(front) = self.buckets.front() {
            if front.started + window <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

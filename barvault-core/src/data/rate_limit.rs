//! Sliding-window request limiter.
//!
//! The market-data API allows a fixed number of requests per minute per
//! account. Every request the fetch client makes first takes a slot here.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a slot if one is free; otherwise report how long until one frees.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut issued = self.lock();
        while let Some(&oldest) = issued.front() {
            if now.duration_since(oldest) >= self.window {
                issued.pop_front();
            } else {
                break;
            }
        }
        if issued.len() < self.max_requests {
            issued.push_back(now);
            return Ok(());
        }
        let oldest = issued.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Block until a slot is free, then take it. Returns the time spent waiting.
    pub fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            match self.try_acquire() {
                Ok(()) => return started.elapsed(),
                Err(wait) => {
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    std::thread::sleep(wait.max(Duration::from_millis(1)));
                }
            }
        }
    }

    /// Requests issued inside the current window.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

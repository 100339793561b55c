//! Per-source rate limiting.
//!
//! Every source gets its own limiter with two sliding call windows: a
//! short one second window and a long sixty second window, each with
//! its own cap. An acquisition that would overflow a window sleeps
//! until the oldest recorded call ages out, then re-checks. The check
//! and the commit of the new call happen under one lock acquisition,
//! so concurrent callers cannot lose updates.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::SourceSettings;
use crate::error::SourceError;

const SHORT_WINDOW: Duration = Duration::from_secs(1);
const LONG_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct CallLog {
    second: VecDeque<Instant>,
    minute: VecDeque<Instant>,
}

impl CallLog {
    fn prune(&mut self, now: Instant) {
        while self
            .second
            .front()
            .is_some_and(|t| now.duration_since(*t) >= SHORT_WINDOW)
        {
            self.second.pop_front();
        }
        while self
            .minute
            .front()
            .is_some_and(|t| now.duration_since(*t) >= LONG_WINDOW)
        {
            self.minute.pop_front();
        }
    }

    /// Time until the oldest saturating call ages out, or `None` when
    /// both windows have room.
    fn saturation_wait(&self, now: Instant, per_second: u32, per_minute: u32) -> Option<Duration> {
        let mut wait = Duration::ZERO;

        if self.second.len() >= per_second as usize {
            let oldest = self.second.front().copied()?;
            wait = wait.max(SHORT_WINDOW.saturating_sub(now.duration_since(oldest)));
        }
        if self.minute.len() >= per_minute as usize {
            let oldest = self.minute.front().copied()?;
            wait = wait.max(LONG_WINDOW.saturating_sub(now.duration_since(oldest)));
        }

        (wait > Duration::ZERO).then_some(wait)
    }

    fn record(&mut self, now: Instant) {
        self.second.push_back(now);
        self.minute.push_back(now);
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    source: String,
    per_second: u32,
    per_minute: u32,
    log: Mutex<CallLog>,
}

impl RateLimiter {
    pub fn new(source: impl Into<String>, per_second: u32, per_minute: u32) -> Self {
        Self {
            source: source.into(),
            per_second: per_second.max(1),
            per_minute: per_minute.max(1),
            log: Mutex::new(CallLog::default()),
        }
    }

    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self::new(&settings.name, settings.per_second, settings.per_minute)
    }

    /// Wait for a call slot in both windows and claim it. Total wait
    /// is capped at the long window; past that the call fails as
    /// transient rather than stalling its task indefinitely.
    pub async fn acquire(&self) -> Result<(), SourceError> {
        let started = Instant::now();

        loop {
            let wait = {
                let mut log = self.log.lock().await;
                let now = Instant::now();
                log.prune(now);
                match log.saturation_wait(now, self.per_second, self.per_minute) {
                    None => {
                        log.record(now);
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };

            if started.elapsed() + wait > LONG_WINDOW {
                warn!(source = %self.source, "rate limiter wait cap exceeded");
                return Err(SourceError::transient(
                    &self.source,
                    "rate limiter wait exceeded the 60s window",
                ));
            }

            debug!(source = %self.source, ?wait, "rate limited, waiting");
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_respects_the_short_window() {
        let limiter = RateLimiter::new("test", 2, 100);
        let mut stamps = Vec::new();

        for _ in 0..6 {
            limiter.acquire().await.unwrap();
            stamps.push(Instant::now());
        }

        // No 3 acquisitions within any sliding 1-second window.
        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .filter(|t| t.duration_since(*start) < SHORT_WINDOW)
                .count();
            assert!(in_window <= 2, "window starting at call {i} holds {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn long_window_throttles_after_short_bursts() {
        let limiter = RateLimiter::new("test", 10, 3);
        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        let before = Instant::now();
        limiter.acquire().await.unwrap();
        assert!(Instant::now().duration_since(before) >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_never_overfill_a_window() {
        let limiter = std::sync::Arc::new(RateLimiter::new("test", 3, 100));
        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await.unwrap();
                Instant::now()
            }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }
        stamps.sort();

        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .filter(|t| t.duration_since(*start) < SHORT_WINDOW)
                .count();
            assert!(in_window <= 3);
        }
    }
}

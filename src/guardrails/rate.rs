use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DEFAULT_RATE_LIMIT_PER_MINUTE;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Past the window edge; a hit exactly one window old still counts.
const EDGE: Duration = Duration::from_millis(1);

/// Timestamps of admitted actions inside the trailing window.
#[derive(Debug)]
pub struct SlidingWindow {
    cap: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// A cap of zero falls back to the default.
    pub fn new(cap: usize) -> Self {
        Self::with_window(cap, RATE_WINDOW)
    }

    pub fn with_window(cap: usize, window: Duration) -> Self {
        let cap = if cap == 0 { DEFAULT_RATE_LIMIT_PER_MINUTE as usize } else { cap };
        Self { cap, window, hits: VecDeque::with_capacity(cap) }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// The window is inclusive: `[now - window, now]`.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn occupancy(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    pub fn try_admit(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.hits.len() < self.cap {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until admission would succeed; zero when it already would.
    pub fn until_free(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.hits.len() < self.cap {
            return Duration::ZERO;
        }
        self.hits
            .front()
            .map(|oldest| (*oldest + self.window + EDGE).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

/// Thread-safe standalone limiter over a [`SlidingWindow`].
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<SlidingWindow>,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self { inner: Mutex::new(SlidingWindow::new(max_per_minute)) }
    }

    pub fn allow(&self) -> bool {
        let mut w = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        w.try_admit(Instant::now())
    }

    /// Resolves once a slot was taken. Drop the future to give up.
    pub async fn wait(&self) {
        loop {
            let delay = {
                let mut w = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                if w.try_admit(now) {
                    return;
                }
                w.until_free(now)
            };
            tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
        }
    }
}

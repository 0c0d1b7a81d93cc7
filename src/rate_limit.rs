//! Fixed-window admission counter keyed by source.
//!
//! Each key gets a 60 second window that opens on its first attempt. Bursts
//! straddling a window boundary can reach twice the nominal rate.

use std::{
    collections::HashMap,
    hash::Hash,
    time::{Duration, Instant},
};

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// How long a closed window is kept before the sweep evicts it.
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter<K> {
    /// Attempts admitted per window. The attempt that opens a window is
    /// always admitted.
    limit: u32,
    window: Duration,
    entries: HashMap<K, Window>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self::with_window(limit, RATE_WINDOW)
    }

    #[must_use]
    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            entries: HashMap::new(),
        }
    }

    /// Records an attempt for `key` and reports whether it is admitted.
    pub fn check(&mut self, key: K) -> bool {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: K, now: Instant) -> bool {
        match self.entries.get_mut(&key) {
            Some(window) if now <= window.reset_at => {
                if window.count >= self.limit {
                    return false;
                }
                window.count += 1;
                true
            }
            _ => {
                self.entries.insert(
                    key,
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    /// Evicts windows that closed more than [`STALE_AFTER`] before `now`.
    /// Returns how many entries were removed.
    pub fn prune_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, window| now <= window.reset_at + STALE_AFTER);
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

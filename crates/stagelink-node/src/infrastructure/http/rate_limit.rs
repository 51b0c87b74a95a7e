//! Per-address throttling for the pairing endpoints.
//!
//! The pairing server is unauthenticated by design (trust comes from the
//! challenge/response, not from the HTTP layer), so the only HTTP-level
//! protection is volume: each source address gets a fixed number of
//! requests per sliding window.  State is in-memory; a restart forgets
//! all counters.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by source address.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request from `addr` at `now` and returns whether it is
    /// allowed.  Timestamps older than the window fall out of the count;
    /// a rejected request is not counted.
    pub fn check(&self, addr: IpAddr, now: Instant) -> bool {
        let mut hits = self.hits.lock().unwrap();
        // Drop addresses whose newest hit has aged out; the map stays
        // bounded by sources seen within the current window.
        hits.retain(|_, entry| {
            entry
                .back()
                .is_some_and(|t| now.duration_since(*t) < self.window)
        });
        let entry = hits.entry(addr).or_default();
        while entry
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            entry.pop_front();
        }
        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push_back(now);
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

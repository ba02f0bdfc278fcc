//! Per-key counting window.

use std::time::{SystemTime, UNIX_EPOCH};

/// A fixed counting window for a single client key.
///
/// Created with `count == 1`, reflecting the request that triggered
/// creation. Once `now >= reset_at_ms` the window is logically expired and
/// must be replaced, never incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Requests seen in the current window
    pub count: u64,
    /// Absolute expiry timestamp, epoch milliseconds
    pub reset_at_ms: u64,
}

impl Window {
    /// Start a new window for a key, counting the request that opened it.
    pub fn open(now_ms: u64, window_duration_ms: u64) -> Self {
        Self {
            count: 1,
            reset_at_ms: now_ms + window_duration_ms,
        }
    }

    /// Whether this window has elapsed. A request arriving at exactly
    /// `reset_at_ms` starts a new window rather than extending this one.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.reset_at_ms <= now_ms
    }

    /// Quota left under `limit`, never negative.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Window expiry as epoch seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> u64 {
        ceil_millis_to_secs(self.reset_at_ms)
    }

    /// Seconds until this window resets, rounded up.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        ceil_millis_to_secs(self.reset_at_ms.saturating_sub(now_ms))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn ceil_millis_to_secs(millis: u64) -> u64 {
    millis.div_ceil(1000)
}

//! Core admission controller implementation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::reaper::{self, Reaper};
use super::request::{default_key_extractor, KeyExtractor, RequestInfo, SkipPredicate, UNKNOWN_KEY};
use super::window::{epoch_millis, Window};
use crate::config::AdmissionConfig;
use crate::error::Result;

/// Response header names the serving layer attaches from a [`Decision`].
pub mod headers {
    pub const LIMIT: &str = "X-RateLimit-Limit";
    pub const REMAINING: &str = "X-RateLimit-Remaining";
    pub const RESET: &str = "X-RateLimit-Reset";
    pub const RETRY_AFTER: &str = "Retry-After";
}

/// Quota state reported alongside a decision when header emission is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Configured cap per window
    pub limit: u64,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// Window expiry as epoch seconds, rounded up
    pub reset_epoch_secs: u64,
}

/// JSON body the serving layer returns with a 429 response.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionBody {
    pub error: String,
    #[serde(rename = "retryAfterSeconds")]
    pub retry_after_seconds: u64,
}

/// The outcome of a single admission check.
///
/// Rejection is a normal outcome, not an error: it carries the retry delay
/// the caller surfaces as a structured 429 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Seconds until the client may retry, set only on rejection
    pub retry_after_secs: Option<u64>,
    /// Quota headers to attach, set on every decision when enabled
    pub quota: Option<QuotaSnapshot>,
}

impl Decision {
    fn admit(quota: Option<QuotaSnapshot>) -> Self {
        Self {
            admitted: true,
            retry_after_secs: None,
            quota,
        }
    }

    fn reject(retry_after_secs: u64, quota: Option<QuotaSnapshot>) -> Self {
        Self {
            admitted: false,
            retry_after_secs: Some(retry_after_secs),
            quota,
        }
    }

    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// The 429 body for a rejected decision, `None` for an admitted one.
    pub fn rejection_body(&self) -> Option<RejectionBody> {
        self.retry_after_secs.map(|secs| RejectionBody {
            error: "Too many requests".to_string(),
            retry_after_seconds: secs,
        })
    }
}

/// Builder for an [`AdmissionController`].
pub struct AdmissionControllerBuilder {
    config: AdmissionConfig,
    key_extractor: KeyExtractor,
    skip_predicate: Option<SkipPredicate>,
}

impl AdmissionControllerBuilder {
    /// Override how a client key is derived from a request.
    pub fn key_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.key_extractor = extractor;
        self
    }

    /// Exempt requests matching the predicate from limiting entirely.
    pub fn skip_when(mut self, predicate: SkipPredicate) -> Self {
        self.skip_predicate = Some(predicate);
        self
    }

    /// Validate the configuration and build the controller, starting its
    /// background reaper.
    pub fn build(self) -> Result<AdmissionController> {
        self.config.validate()?;

        let windows: Arc<DashMap<String, Window>> = Arc::new(DashMap::new());
        let reaper = Reaper::spawn(Arc::clone(&windows), self.config.window_duration_ms);

        debug!(
            window_duration_ms = self.config.window_duration_ms,
            max_requests_per_window = self.config.max_requests_per_window,
            "Admission controller initialized"
        );

        Ok(AdmissionController {
            config: self.config,
            windows,
            key_extractor: self.key_extractor,
            skip_predicate: self.skip_predicate,
            reaper,
        })
    }
}

/// Per-key request admission controller with fixed counting windows.
///
/// Each instance owns its window store and its reaper task; dropping the
/// controller (or calling [`shutdown`](Self::shutdown)) cancels the task, so
/// no timer outlives the instance.
///
/// Fixed windows admit up to `2 x max_requests_per_window` requests in a
/// short span straddling a window boundary. That burst characteristic is
/// inherent to fixed-window counting, not a defect.
pub struct AdmissionController {
    config: AdmissionConfig,
    windows: Arc<DashMap<String, Window>>,
    key_extractor: KeyExtractor,
    skip_predicate: Option<SkipPredicate>,
    reaper: Reaper,
}

impl AdmissionController {
    /// Create a controller with the default key extractor (peer IP with a
    /// forwarded-for fallback).
    ///
    /// Construction performs no I/O. The reaper task is scheduled when a
    /// Tokio runtime is current; otherwise expired windows are still
    /// replaced lazily on access.
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a controller with a custom extractor or skip rule.
    pub fn builder(config: AdmissionConfig) -> AdmissionControllerBuilder {
        AdmissionControllerBuilder {
            config,
            key_extractor: default_key_extractor(),
            skip_predicate: None,
        }
    }

    /// Decide whether to admit a request.
    ///
    /// Synchronous and bounded: a store lookup and an in-place update under
    /// that key's entry guard, nothing else. Any internal fault is caught
    /// at this boundary, logged, and converted to an admit; a broken
    /// limiter must not take down the service it protects.
    pub fn admit(&self, request: &RequestInfo) -> Decision {
        self.admit_at(request, epoch_millis())
    }

    /// [`admit`](Self::admit) with an explicit clock reading, for callers
    /// that need deterministic window boundaries (simulations, tests).
    pub fn admit_at(&self, request: &RequestInfo, now_ms: u64) -> Decision {
        match panic::catch_unwind(AssertUnwindSafe(|| self.decide(request, now_ms))) {
            Ok(decision) => decision,
            Err(_) => {
                warn!("Admission decision panicked, failing open");
                Decision::admit(None)
            }
        }
    }

    fn decide(&self, request: &RequestInfo, now_ms: u64) -> Decision {
        if let Some(skip) = &self.skip_predicate {
            if skip(request) {
                trace!("Request matches skip predicate, admitting unconditionally");
                return Decision::admit(None);
            }
        }

        let key = self.extract_key(request);
        let limit = self.config.max_requests_per_window;

        trace!(key = %key, "Checking admission");

        // Expiry check and increment happen under the entry guard, so two
        // concurrent requests cannot both observe the count below the cap.
        let window = match self.windows.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                if window.is_expired(now_ms) {
                    *window = Window::open(now_ms, self.config.window_duration_ms);
                } else {
                    window.count += 1;
                }
                *window
            }
            Entry::Vacant(vacant) => {
                debug!(key = %key, "Opening new counting window");
                *vacant.insert(Window::open(now_ms, self.config.window_duration_ms))
            }
        };

        let quota = if self.config.emit_headers {
            Some(QuotaSnapshot {
                limit,
                remaining: window.remaining(limit),
                reset_epoch_secs: window.reset_epoch_secs(),
            })
        } else {
            None
        };

        if window.count > limit {
            let retry_after_secs = window.retry_after_secs(now_ms);
            debug!(
                key = %key,
                retry_after_secs = retry_after_secs,
                "Request over limit, rejecting"
            );
            Decision::reject(retry_after_secs, quota)
        } else {
            Decision::admit(quota)
        }
    }

    /// Derive the client key, degrading to the sentinel on any failure.
    fn extract_key(&self, request: &RequestInfo) -> String {
        let extracted =
            panic::catch_unwind(AssertUnwindSafe(|| (self.key_extractor)(request)));

        match extracted {
            Ok(Some(key)) if !key.is_empty() => key,
            Ok(_) => UNKNOWN_KEY.to_string(),
            Err(_) => {
                warn!("Key extractor panicked, using sentinel key");
                UNKNOWN_KEY.to_string()
            }
        }
    }

    /// Remove every expired window from the store, returning how many were
    /// evicted. The reaper calls this on its schedule; it is also exposed
    /// for tests and manual maintenance.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        reaper::sweep(&self.windows, now_ms)
    }

    /// Get the number of keys with a tracked window.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Get the current window for a key, if one is tracked.
    ///
    /// Returns `None` if no window exists for the key.
    pub fn window_for(&self, key: &str) -> Option<Window> {
        self.windows.get(key).map(|entry| *entry.value())
    }

    /// Clear all tracked windows.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }

    /// Cancel the background reaper. Dropping the controller does the same.
    pub fn shutdown(&self) {
        self.reaper.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: u64 = 60_000;

    fn controller(max_requests: u64) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            window_duration_ms: WINDOW_MS,
            max_requests_per_window: max_requests,
            emit_headers: true,
        })
        .unwrap()
    }

    fn request_from(ip: &str) -> RequestInfo {
        RequestInfo::from_addr(format!("{}:50000", ip).parse().unwrap())
    }

    #[test]
    fn test_cap_is_inclusive() {
        let controller = controller(3);
        let request = request_from("203.0.113.7");

        for i in 0..3 {
            let decision = controller.admit_at(&request, i * 1_000);
            assert!(decision.is_admitted(), "request {} should be admitted", i + 1);
        }

        let decision = controller.admit_at(&request, 3_000);
        assert!(!decision.is_admitted());
        assert_eq!(decision.retry_after_secs, Some(57));
    }

    #[test]
    fn test_remaining_counts_down_and_stops_at_zero() {
        let controller = controller(3);
        let request = request_from("203.0.113.7");

        let mut reported = Vec::new();
        for i in 0..5 {
            let decision = controller.admit_at(&request, i * 1_000);
            reported.push(decision.quota.unwrap().remaining);
        }

        assert_eq!(reported, vec![2, 1, 0, 0, 0]);
    }

    #[test]
    fn test_quota_reported_on_rejection_too() {
        let controller = controller(1);
        let request = request_from("203.0.113.7");

        controller.admit_at(&request, 0);
        let decision = controller.admit_at(&request, 500);

        assert!(!decision.is_admitted());
        let quota = decision.quota.unwrap();
        assert_eq!(quota.limit, 1);
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.reset_epoch_secs, 60);
    }

    #[test]
    fn test_keys_are_independent() {
        let controller = controller(3);
        let a = request_from("203.0.113.7");
        let b = request_from("198.51.100.9");

        for i in 0..4 {
            controller.admit_at(&a, i * 1_000);
        }
        assert!(!controller.admit_at(&a, 4_000).is_admitted());

        let decision = controller.admit_at(&b, 4_000);
        assert!(decision.is_admitted());
        assert_eq!(decision.quota.unwrap().remaining, 2);
    }

    #[test]
    fn test_expired_window_is_replaced_not_incremented() {
        let controller = controller(3);
        let request = request_from("203.0.113.7");

        for i in 0..4 {
            controller.admit_at(&request, i * 1_000);
        }

        let decision = controller.admit_at(&request, 61_000);
        assert!(decision.is_admitted());
        assert_eq!(decision.quota.unwrap().remaining, 2);

        let window = controller.window_for("203.0.113.7").unwrap();
        assert_eq!(window.count, 1);
        assert_eq!(window.reset_at_ms, 121_000);
    }

    #[test]
    fn test_request_at_exact_reset_instant_starts_new_window() {
        let controller = controller(1);
        let request = request_from("203.0.113.7");

        controller.admit_at(&request, 0);
        assert!(!controller.admit_at(&request, 1_000).is_admitted());

        let decision = controller.admit_at(&request, WINDOW_MS);
        assert!(decision.is_admitted());
        assert_eq!(controller.window_for("203.0.113.7").unwrap().count, 1);
    }

    #[test]
    fn test_skip_predicate_bypasses_store() {
        let controller = AdmissionController::builder(AdmissionConfig::default())
            .skip_when(Arc::new(|request: &RequestInfo| {
                request.path.as_deref() == Some("/health")
            }))
            .build()
            .unwrap();

        let request = request_from("203.0.113.7").with_path("/health");
        let decision = controller.admit_at(&request, 0);

        assert!(decision.is_admitted());
        assert!(decision.quota.is_none());
        assert_eq!(controller.window_count(), 0);
    }

    #[test]
    fn test_missing_identity_falls_back_to_sentinel() {
        let controller = controller(3);

        let decision = controller.admit_at(&RequestInfo::new(), 0);
        assert!(decision.is_admitted());
        assert_eq!(controller.window_for(UNKNOWN_KEY).unwrap().count, 1);
    }

    #[test]
    fn test_panicking_extractor_fails_open() {
        let controller = AdmissionController::builder(AdmissionConfig::default())
            .key_extractor(Arc::new(|_: &RequestInfo| panic!("boom")))
            .build()
            .unwrap();

        let decision = controller.admit_at(&request_from("203.0.113.7"), 0);
        assert!(decision.is_admitted());
        assert_eq!(controller.window_for(UNKNOWN_KEY).unwrap().count, 1);
    }

    #[test]
    fn test_headers_disabled_yields_no_quota() {
        let controller = AdmissionController::new(AdmissionConfig {
            emit_headers: false,
            ..Default::default()
        })
        .unwrap();

        let decision = controller.admit_at(&request_from("203.0.113.7"), 0);
        assert!(decision.is_admitted());
        assert!(decision.quota.is_none());
    }

    #[test]
    fn test_custom_key_extractor() {
        let controller = AdmissionController::builder(AdmissionConfig::default())
            .key_extractor(Arc::new(|request: &RequestInfo| request.path.clone()))
            .build()
            .unwrap();

        controller.admit_at(&RequestInfo::new().with_path("/v1/query"), 0);
        assert_eq!(controller.window_for("/v1/query").unwrap().count, 1);
    }

    #[test]
    fn test_rejection_body_shape() {
        let controller = controller(1);
        let request = request_from("203.0.113.7");

        controller.admit_at(&request, 0);
        let decision = controller.admit_at(&request, 2_500);

        let body = decision.rejection_body().unwrap();
        assert_eq!(body.error, "Too many requests");
        assert_eq!(body.retry_after_seconds, 58);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "Too many requests");
        assert_eq!(json["retryAfterSeconds"], 58);
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let result = AdmissionController::new(AdmissionConfig {
            window_duration_ms: 0,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_request_after_reaping_starts_fresh() {
        let controller = controller(3);
        let request = request_from("203.0.113.7");

        for i in 0..4 {
            controller.admit_at(&request, i * 1_000);
        }

        assert_eq!(controller.sweep_expired(WINDOW_MS), 1);
        assert_eq!(controller.window_count(), 0);

        let decision = controller.admit_at(&request, WINDOW_MS + 1_000);
        assert!(decision.is_admitted());
        assert_eq!(decision.quota.unwrap().remaining, 2);
        assert_eq!(controller.window_for("203.0.113.7").unwrap().count, 1);
    }

    #[test]
    fn test_clear_windows() {
        let controller = controller(3);
        controller.admit_at(&request_from("203.0.113.7"), 0);
        assert_eq!(controller.window_count(), 1);

        controller.clear();
        assert_eq!(controller.window_count(), 0);
    }

    #[test]
    fn test_concurrent_admissions_respect_cap_exactly() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let limit = 100;
        let controller = Arc::new(controller(limit));
        let admitted = Arc::new(AtomicUsize::new(0));
        let request = request_from("203.0.113.7");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let admitted = Arc::clone(&admitted);
                let request = request.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if controller.admit(&request).is_admitted() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // 400 attempts against a cap of 100: exactly the cap admitted.
        assert_eq!(admitted.load(Ordering::SeqCst), limit as usize);
    }
}

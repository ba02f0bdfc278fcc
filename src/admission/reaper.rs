//! Background eviction of expired windows.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::window::{epoch_millis, Window};

/// Periodic sweep task that keeps the window store from accumulating idle
/// keys. Owned by the controller; aborted on drop so the schedule never
/// outlives its store.
pub(crate) struct Reaper {
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Schedule the sweep on the current Tokio runtime.
    ///
    /// When no runtime is current the reaper is disabled; expired windows
    /// are still replaced lazily on next access, the store just is not
    /// trimmed in the background.
    pub(crate) fn spawn(store: Arc<DashMap<String, Window>>, window_duration_ms: u64) -> Self {
        let period = sweep_period(window_duration_ms);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;
                    let evicted = sweep(&store, epoch_millis());
                    if evicted > 0 {
                        debug!(evicted = evicted, "Reaper evicted expired windows");
                    }
                }
            })),
            Err(_) => {
                debug!("No Tokio runtime available, reaper disabled");
                None
            }
        };

        Self { handle }
    }

    /// Cancel the sweep task. Safe to call more than once.
    pub(crate) fn stop(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sweep period: half the window, floored at one second so short windows do
/// not turn the reaper into a busy loop.
pub(crate) fn sweep_period(window_duration_ms: u64) -> Duration {
    Duration::from_millis((window_duration_ms / 2).max(1_000))
}

/// Remove every entry whose window has elapsed, returning the eviction
/// count. A single retain pass; concurrent admissions only wait for their
/// own key's shard.
pub(crate) fn sweep(store: &DashMap<String, Window>, now_ms: u64) -> usize {
    let before = store.len();
    store.retain(|_, window| !window.is_expired(now_ms));
    before.saturating_sub(store.len())
}

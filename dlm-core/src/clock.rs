// Licensed under the MIT License.

//! Wall clock source and host identity, both injectable for deterministic tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// The environment variable consulted before falling back to OS hostname
/// resolution for [`SystemClock::host_id`].
const HOST_ID_ENV_VAR: &str = "DLM_HOST_ID";

/// Used when neither `DLM_HOST_ID` nor OS hostname resolution yields a value.
const UNKNOWN_HOST_ID: &str = "unknown-host";

/// Monotonic-ish wall clock and stable host identity, injectable so the
/// protocol layer can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary epoch, non-decreasing within a process.
    fn now(&self) -> u64;

    /// A stable per-process diagnostic string. Correctness does not depend on
    /// uniqueness.
    fn host_id(&self) -> String;

    /// A fresh globally-unique token, distinct on every call.
    fn new_version(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// The production [`Clock`]: real wall-clock seconds and a host identity
/// resolved from `DLM_HOST_ID`, then the OS hostname, then a constant.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn host_id(&self) -> String {
        if let Ok(id) = std::env::var(HOST_ID_ENV_VAR) {
            if !id.is_empty() {
                return id;
            }
        }
        hostname::get()
            .ok()
            .map(|os_name| os_name.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_HOST_ID.to_string())
    }
}

/// A clock with a manually-advanced seconds counter, for tests that simulate
/// lease expiry without real sleeps.
#[derive(Debug)]
pub struct FakeClock {
    seconds: AtomicU64,
    host_id: String,
}

impl FakeClock {
    /// Creates a fake clock starting at `start_seconds`.
    #[must_use]
    pub fn new(start_seconds: u64, host_id: impl Into<String>) -> Self {
        Self {
            seconds: AtomicU64::new(start_seconds),
            host_id: host_id.into(),
        }
    }

    /// Advances the clock by `delta_seconds`.
    pub fn advance(&self, delta_seconds: u64) {
        self.seconds.fetch_add(delta_seconds, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }

    fn host_id(&self) -> String {
        self.host_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new(100, "host-a");
        assert_eq!(clock.now(), 100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        assert_eq!(clock.host_id(), "host-a");
    }

    #[test]
    fn new_version_is_unique_per_call() {
        let clock = FakeClock::new(0, "host-a");
        let a = clock.new_version();
        let b = clock.new_version();
        assert_ne!(a, b);
    }
}

// Licensed under the MIT License.

//! Numeric policy for a lock: lease, refresh cadence, acquire timeout, retry interval.

use std::time::Duration;

use derive_builder::{Builder, UninitializedFieldError};

use crate::error::{Error, ErrorKind};

/// Default advertised lease window.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(20);
/// Default background refresh cadence.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(5);
/// Minimum slack between `refresh_period` and `lease` reserved for network latency.
const MIN_NETWORK_SLACK: Duration = Duration::from_secs(1);

/// Parameters governing a single lock name's acquire/refresh behavior.
///
/// Constructed via [`LockParamsBuilder`], which enforces the numeric policy at
/// build time rather than silently clamping a caller-specified duration.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate", error = "Error"))]
pub struct LockParams {
    /// Advertised lease window. Other clients must wait at least this long
    /// before attempting to steal.
    #[builder(default = "DEFAULT_LEASE")]
    pub lease: Duration,
    /// How often a held lock is refreshed in the background. Must be strictly
    /// less than `lease`, with at least one second of network slack.
    #[builder(default = "DEFAULT_REFRESH_PERIOD")]
    pub refresh_period: Duration,
    /// How long `acquire` will keep retrying before failing with
    /// `AcquireTimeout`. `None` means unbounded.
    #[builder(default)]
    pub acquire_timeout: Option<Duration>,
    /// How long to wait between acquire retry attempts when the lock is
    /// currently held by someone else. `None` means `lease / 2`, via
    /// [`LockParams::retry_interval`].
    #[builder(default = "None")]
    pub retry_interval_override: Option<Duration>,
}

impl LockParams {
    /// The effective retry interval: the explicit override if one was set,
    /// otherwise `lease / 2`.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval_override
            .unwrap_or_else(|| self.lease / 2)
    }
}

/// Lets [`LockParamsBuilder::build`] return [`Error`] directly: a violated
/// numeric policy surfaces to callers as [`ErrorKind::IllegalState`], per
/// the crate's documented error contract, rather than as a disconnected
/// builder-internal error type.
impl From<UninitializedFieldError> for Error {
    fn from(error: UninitializedFieldError) -> Self {
        ErrorKind::IllegalState(error.to_string()).into()
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        ErrorKind::IllegalState(message).into()
    }
}

impl LockParamsBuilder {
    /// Validates the numeric policy from the lease-and-fencing protocol:
    /// `lease >= 2 * refresh_period`, and `refresh_period <= lease -
    /// network_slack` with at least one second of slack.
    ///
    /// # Errors
    /// Returns a `String` describing the violated constraint, converted into
    /// [`ErrorKind::IllegalState`] by [`LockParamsBuilder::build`].
    fn validate(&self) -> Result<(), String> {
        let lease = self.lease.unwrap_or(DEFAULT_LEASE);
        let refresh_period = self.refresh_period.unwrap_or(DEFAULT_REFRESH_PERIOD);

        if refresh_period >= lease {
            return Err(format!(
                "refresh_period ({refresh_period:?}) must be strictly less than lease ({lease:?})"
            ));
        }
        if lease < refresh_period * 2 {
            return Err(format!(
                "lease ({lease:?}) must be at least twice refresh_period ({refresh_period:?})"
            ));
        }
        if lease - refresh_period < MIN_NETWORK_SLACK {
            return Err(format!(
                "refresh_period ({refresh_period:?}) leaves less than {MIN_NETWORK_SLACK:?} of network slack before lease ({lease:?}) expires"
            ));
        }
        Ok(())
    }
}

impl Default for LockParams {
    fn default() -> Self {
        LockParamsBuilder::default()
            .build()
            .expect("default lease/refresh_period satisfy the numeric policy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults_satisfy_policy() {
        let params = LockParams::default();
        assert_eq!(params.lease, DEFAULT_LEASE);
        assert_eq!(params.refresh_period, DEFAULT_REFRESH_PERIOD);
        assert_eq!(params.retry_interval(), DEFAULT_LEASE / 2);
    }

    #[test_case(Duration::from_secs(20), Duration::from_secs(5); "default-shaped")]
    #[test_case(Duration::from_secs(10), Duration::from_secs(4); "tight but legal")]
    fn accepts_legal_combinations(lease: Duration, refresh_period: Duration) {
        LockParamsBuilder::default()
            .lease(lease)
            .refresh_period(refresh_period)
            .build()
            .unwrap();
    }

    #[test_case(Duration::from_secs(5), Duration::from_secs(5); "refresh equals lease")]
    #[test_case(Duration::from_secs(5), Duration::from_secs(3); "less than 2x")]
    #[test_case(Duration::from_secs(3), Duration::from_millis(2500); "no network slack")]
    fn rejects_illegal_combinations(lease: Duration, refresh_period: Duration) {
        let result = LockParamsBuilder::default()
            .lease(lease)
            .refresh_period(refresh_period)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn retry_interval_override_is_respected() {
        let params = LockParamsBuilder::default()
            .retry_interval_override(Some(Duration::from_secs(1)))
            .build()
            .unwrap();
        assert_eq!(params.retry_interval(), Duration::from_secs(1));
    }
}

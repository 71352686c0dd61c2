//! Lease timing parameters and the waits derived from them.

use crate::utils::{ErrorKind, SafeleaseError};

use tokio::time::Duration;

/// Upper bound on the lease duration (one day). Keeps every derived wait,
/// microsecond conversion and deadline instant far from overflowing.
pub const MAX_LEASE_MS: u64 = 24 * 60 * 60 * 1000;

/// Validated timing parameters of one lease.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LeaseParams {
    /// Maximum time the holder may go without a confirmed renewal.
    lease_ms: u64,

    /// Maximum time any single sector I/O may take.
    op_max_ms: u64,
}

impl LeaseParams {
    /// Both durations must be positive, `op_max_ms <= lease_ms` and
    /// `lease_ms <= MAX_LEASE_MS`.
    pub fn new(lease_ms: u64, op_max_ms: u64) -> Result<Self, SafeleaseError> {
        if lease_ms == 0 {
            Err(SafeleaseError::new(
                ErrorKind::InvalidParameters,
                "lease duration must be positive",
            ))
        } else if lease_ms > MAX_LEASE_MS {
            Err(SafeleaseError::new(
                ErrorKind::InvalidParameters,
                format!(
                    "lease duration {}ms exceeds maximum {}ms",
                    lease_ms, MAX_LEASE_MS
                ),
            ))
        } else if op_max_ms == 0 {
            Err(SafeleaseError::new(
                ErrorKind::InvalidParameters,
                "op timeout must be positive",
            ))
        } else if op_max_ms > lease_ms {
            Err(SafeleaseError::new(
                ErrorKind::InvalidParameters,
                format!(
                    "op timeout {}ms exceeds lease duration {}ms",
                    op_max_ms, lease_ms
                ),
            ))
        } else {
            Ok(LeaseParams {
                lease_ms,
                op_max_ms,
            })
        }
    }

    /// Like `new()` but also enforces the deployment rule that the op
    /// timeout is a whole number of seconds.
    pub fn new_strict(
        lease_ms: u64,
        op_max_ms: u64,
    ) -> Result<Self, SafeleaseError> {
        if op_max_ms < 1000 || op_max_ms % 1000 != 0 {
            return Err(SafeleaseError::new(
                ErrorKind::InvalidParameters,
                format!(
                    "op timeout {}ms is not a whole number of seconds",
                    op_max_ms
                ),
            ));
        }
        Self::new(lease_ms, op_max_ms)
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
    }

    pub fn op_max_ms(&self) -> u64 {
        self.op_max_ms
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_max_ms)
    }

    /// Wait before re-reading a tag that another owner may still be
    /// renewing: `lease + 6 * op_max`.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.lease_ms + 6 * self.op_max_ms)
    }

    /// Contention window between writing a claim and reading it back:
    /// `2 * op_max`.
    pub fn contention_wait(&self) -> Duration {
        Duration::from_millis(2 * self.op_max_ms)
    }
}

#[cfg(test)]
mod params_tests {
    use super::*;

    #[test]
    fn derived_waits() -> Result<(), SafeleaseError> {
        let params = LeaseParams::new(10000, 1000)?;
        assert_eq!(params.backoff(), Duration::from_millis(16000));
        assert_eq!(params.contention_wait(), Duration::from_millis(2000));
        assert_eq!(params.lease_duration(), Duration::from_secs(10));
        assert_eq!(params.op_timeout(), Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn invalid_params() {
        for (lease_ms, op_max_ms) in [(0, 0), (1000, 0), (0, 1000), (999, 1000)]
        {
            assert_eq!(
                LeaseParams::new(lease_ms, op_max_ms).map_err(|e| e.kind()),
                Err(ErrorKind::InvalidParameters)
            );
        }
        assert!(LeaseParams::new(1000, 1000).is_ok());
        assert!(LeaseParams::new(300, 20).is_ok());
    }

    #[test]
    fn oversized_params() -> Result<(), SafeleaseError> {
        for (lease_ms, op_max_ms) in [
            (u64::MAX, 1000),
            (u64::MAX, u64::MAX),
            (MAX_LEASE_MS + 1, 1000),
        ] {
            assert_eq!(
                LeaseParams::new(lease_ms, op_max_ms).map_err(|e| e.kind()),
                Err(ErrorKind::InvalidParameters)
            );
            assert!(LeaseParams::new_strict(lease_ms, op_max_ms).is_err());
        }

        // largest accepted values still yield representable waits
        let params = LeaseParams::new_strict(MAX_LEASE_MS, MAX_LEASE_MS)?;
        assert_eq!(
            params.backoff(),
            Duration::from_millis(7 * MAX_LEASE_MS)
        );
        assert_eq!(
            params.contention_wait(),
            Duration::from_millis(2 * MAX_LEASE_MS)
        );
        Ok(())
    }

    #[test]
    fn strict_params() {
        assert!(LeaseParams::new_strict(10000, 1000).is_ok());
        assert!(LeaseParams::new_strict(10000, 1500).is_err());
        assert!(LeaseParams::new_strict(10000, 500).is_err());
        assert!(LeaseParams::new_strict(1000, 2000).is_err());
    }
}

//! Shared defaults and hard limits for scans.
//!
//! This module centralizes:
//! - Polling and backoff durations used by the engine loops
//! - Retry budgets for externally driven scans
//! - The maximum number of points a plan may generate
//!
//! The engine configuration uses these values as its defaults.

use crate::error::ScanError;
use std::time::Duration;

// =============================================================================
// Timing Constants
// =============================================================================

/// Delay between completion polls while counting (25 ms).
pub const DEFAULT_COUNT_LOOP_DELAY: Duration = Duration::from_millis(25);

/// Backoff while an external decision service has no position ready (1 second).
pub const DEFAULT_POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Sampling interval of continuous scans (1 second).
pub const DEFAULT_CONTINUOUS_TIMEDELTA: Duration = Duration::from_secs(1);

// =============================================================================
// Budgets
// =============================================================================

/// Infeasible positions an adaptive scan tolerates in a row before giving up.
pub const DEFAULT_RETRY_BUDGET: u32 = 20;

/// Continuous scans move at `speed / DEFAULT_SPEED_DIVISOR` unless told otherwise.
pub const DEFAULT_SPEED_DIVISOR: f64 = 5.0;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum number of points a single plan may generate.
pub const MAX_POINTS: usize = 10_000_000;

/// Validate a generated point count against a limit.
pub fn validate_point_count(count: usize, max_points: usize) -> Result<usize, ScanError> {
    if count > max_points {
        return Err(ScanError::Config(format!(
            "scan would generate {} points (max {})",
            count, max_points
        )));
    }
    Ok(count)
}

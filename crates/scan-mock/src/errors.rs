//! Error injection framework for mock devices.
//!
//! Enables scripted failures so that the scan engine's failure policies can be
//! exercised deterministically. Every injected failure is a
//! [`DeviceError`] with the configured [`DeviceErrorKind`].

use scan_core::{DeviceError, DeviceErrorKind, DeviceResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Tolerance when matching injected target values.
const TARGET_TOLERANCE: f64 = 1e-9;

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Every call of `operation` fails
    Always {
        /// Operation name, e.g. `start` or `read`
        operation: &'static str,
        /// Kind of the injected error
        kind: DeviceErrorKind,
    },
    /// Fail after N successful calls of `operation`
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before the failures start
        count: u32,
        /// Kind of the injected error
        kind: DeviceErrorKind,
    },
    /// Only the N-th call (1-based) of `operation` fails
    OnCall {
        /// Operation name
        operation: &'static str,
        /// Failing call, 1-based
        call: u32,
        /// Kind of the injected error
        kind: DeviceErrorKind,
    },
    /// `operation` fails whenever it concerns `target`
    OnTarget {
        /// Operation name
        operation: &'static str,
        /// Target the failure applies to
        target: f64,
        /// Kind of the injected error
        kind: DeviceErrorKind,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Calls per operation, counted before the scenarios are checked
    operation_counts: HashMap<&'static str, u32>,
}

/// Error injection configuration for mock devices
#[derive(Clone, Debug, Default)]
pub struct ErrorConfig {
    scenarios: Arc<Vec<ErrorScenario>>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::default()
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Count a call of `operation` and fail it if a scenario says so.
    pub fn check_operation(&self, device: &str, operation: &'static str) -> DeviceResult<()> {
        self.check(device, operation, None)
    }

    /// Like [`check_operation`](Self::check_operation), also matching target scenarios.
    pub fn check_target(
        &self,
        device: &str,
        operation: &'static str,
        target: f64,
    ) -> DeviceResult<()> {
        self.check(device, operation, Some(target))
    }

    /// Number of calls seen for `operation`.
    pub fn calls(&self, operation: &str) -> u32 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.operation_counts.get(operation).copied().unwrap_or(0)
    }

    /// Reset call counters
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = ErrorState::default();
    }

    fn check(&self, device: &str, operation: &'static str, target: Option<f64>) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = state.operation_counts.entry(operation).or_insert(0);
        *current += 1;
        let call = *current;

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::Always { operation: op, kind } if *op == operation => {
                    return Err(DeviceError::new(
                        device,
                        *kind,
                        format!("Injected failure on '{}'", operation),
                    ));
                }
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                    kind,
                } if *op == operation && call > *count => {
                    return Err(DeviceError::new(
                        device,
                        *kind,
                        format!("Injected failure after {} operations", count),
                    ));
                }
                ErrorScenario::OnCall {
                    operation: op,
                    call: n,
                    kind,
                } if *op == operation && call == *n => {
                    return Err(DeviceError::new(
                        device,
                        *kind,
                        format!("Injected failure on call {} of '{}'", n, operation),
                    ));
                }
                ErrorScenario::OnTarget {
                    operation: op,
                    target: bad,
                    kind,
                } if *op == operation => {
                    if let Some(t) = target {
                        if (t - bad).abs() < TARGET_TOLERANCE {
                            return Err(DeviceError::new(
                                device,
                                *kind,
                                format!("Injected failure at target {}", t),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("dev", "read").is_ok());
        }
        assert_eq!(config.calls("read"), 100);
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read",
            count: 5,
            kind: DeviceErrorKind::Communication,
        });

        for i in 0..5 {
            assert!(
                config.check_operation("dev", "read").is_ok(),
                "Operation {} should succeed",
                i + 1
            );
        }
        let err = config.check_operation("dev", "read").unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Communication);
    }

    #[test]
    fn test_on_call_fails_once() {
        let config = ErrorConfig::scenario(ErrorScenario::OnCall {
            operation: "start",
            call: 2,
            kind: DeviceErrorKind::Move,
        });
        assert!(config.check_operation("dev", "start").is_ok());
        assert!(config.check_operation("dev", "start").is_err());
        assert!(config.check_operation("dev", "start").is_ok());
    }

    #[test]
    fn test_on_target_only_matches_target() {
        let config = ErrorConfig::scenario(ErrorScenario::OnTarget {
            operation: "start",
            target: 3.0,
            kind: DeviceErrorKind::Limit,
        });
        assert!(config.check_target("m", "start", 2.0).is_ok());
        let err = config.check_target("m", "start", 3.0).unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Limit);
        assert_eq!(err.device, "m");
        // other operations are unaffected
        assert!(config.check_target("m", "wait", 3.0).is_ok());
    }

    #[test]
    fn test_reset_clears_counters() {
        let config = ErrorConfig::none();
        config.check_operation("dev", "read").unwrap();
        config.reset();
        assert_eq!(config.calls("read"), 0);
    }
}

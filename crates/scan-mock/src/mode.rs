//! Operational modes for mock devices.
//!
//! - **Instant**: moves and counts complete immediately, for unit tests
//! - **Realistic**: moves take `distance / speed` and counts take their
//!   preset time, measured on the tokio clock so tests can pause it

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert_ne!(MockMode::Instant, MockMode::Realistic);
    }
}

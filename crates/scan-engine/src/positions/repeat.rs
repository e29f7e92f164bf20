//! Empty positions for pure counting (time scans, sweeps).

use async_trait::async_trait;
use scan_core::ScanResult;

use super::{PositionSource, SourceLen, SourceStep};
use crate::control::ScanControl;

/// Yields empty positions, a fixed number of times or until stopped.
#[derive(Debug, Clone)]
pub struct RepeatSource {
    remaining: Option<usize>,
    total: Option<usize>,
}

impl RepeatSource {
    /// Exactly `n` points.
    pub fn counted(n: usize) -> Self {
        Self {
            remaining: Some(n),
            total: Some(n),
        }
    }

    /// Points until the scan is stopped from outside.
    pub fn infinite() -> Self {
        Self {
            remaining: None,
            total: None,
        }
    }
}

#[async_trait]
impl PositionSource for RepeatSource {
    fn len_hint(&self) -> SourceLen {
        match self.total {
            Some(n) => SourceLen::Known(n),
            None => SourceLen::Unbounded,
        }
    }

    fn arity(&self) -> Option<usize> {
        Some(0)
    }

    async fn next_position(&mut self, _control: &ScanControl) -> ScanResult<SourceStep> {
        match &mut self.remaining {
            Some(0) => Ok(SourceStep::Exhausted),
            Some(n) => {
                *n -= 1;
                Ok(SourceStep::Position(Vec::new()))
            }
            None => Ok(SourceStep::Position(Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counted_repeats_then_exhausts() {
        let mut source = RepeatSource::counted(2);
        let control = ScanControl::new();
        assert_eq!(
            source.next_position(&control).await.unwrap(),
            SourceStep::Position(vec![])
        );
        assert_eq!(
            source.next_position(&control).await.unwrap(),
            SourceStep::Position(vec![])
        );
        assert_eq!(
            source.next_position(&control).await.unwrap(),
            SourceStep::Exhausted
        );
        assert_eq!(source.len_hint(), SourceLen::Known(2));
    }

    #[tokio::test]
    async fn infinite_never_exhausts() {
        let mut source = RepeatSource::infinite();
        let control = ScanControl::new();
        for _ in 0..1000 {
            assert!(matches!(
                source.next_position(&control).await.unwrap(),
                SourceStep::Position(_)
            ));
        }
        assert_eq!(source.len_hint(), SourceLen::Unbounded);
    }
}

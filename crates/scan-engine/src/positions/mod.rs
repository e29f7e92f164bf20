//! Position sources: where the scan goes next.
//!
//! Every scan kind consumes its positions through the same [`PositionSource`]
//! interface, whether they are pre-computed ([`ListSource`]), repeated empty
//! positions for time series ([`RepeatSource`]) or requested one by one from an
//! external service ([`AdaptiveSource`]).
//!
//! # Outcomes
//!
//! | step                     | meaning                                      |
//! |--------------------------|----------------------------------------------|
//! | `Position(targets)`      | one target per scanned device                |
//! | `Exhausted`              | no more positions, end the scan normally     |
//! | `Terminated(reason)`     | the source gave up, the run fails            |

mod adaptive;
mod list;
mod repeat;

pub use adaptive::{
    AdaptiveSource, ChannelDecisionService, Decision, DecisionRequest, DecisionService, MoveCost,
    MoveCostEstimator, SpeedCostEstimator,
};
pub use list::ListSource;
pub use repeat::RepeatSource;

use async_trait::async_trait;
use scan_core::{PointRecord, ScanResult};

use crate::control::ScanControl;

/// How many positions a source will produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLen {
    /// Exactly this many
    Known(usize),
    /// Until stopped from outside
    Unbounded,
    /// Decided by an external service
    External,
}

impl SourceLen {
    /// Point count for the dataset header (0 if not known).
    pub fn npoints(&self) -> usize {
        match self {
            SourceLen::Known(n) => *n,
            SourceLen::Unbounded | SourceLen::External => 0,
        }
    }
}

/// One step of a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceStep {
    /// Targets, one per scanned device
    Position(Vec<f64>),
    /// Normal end of the sequence
    Exhausted,
    /// The source gave up
    Terminated(String),
}

/// Produces the targets of a scan, one point at a time.
#[async_trait]
pub trait PositionSource: Send {
    /// Expected length.
    fn len_hint(&self) -> SourceLen;

    /// Targets per position, if known before the scan starts.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// Next targets.
    async fn next_position(&mut self, control: &ScanControl) -> ScanResult<SourceStep>;

    /// Whether sinks should see a break before the position just returned.
    fn take_break(&mut self) -> bool {
        false
    }

    /// The point at `position` starts (after PreparePoint).
    async fn on_point_started(&mut self, _position: &[f64]) -> ScanResult<()> {
        Ok(())
    }

    /// The point finished; `record` is `None` if it was skipped.
    async fn on_point_finished(&mut self, _record: Option<&PointRecord>) -> ScanResult<()> {
        Ok(())
    }
}

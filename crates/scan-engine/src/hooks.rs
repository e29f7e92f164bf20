//! Variant hooks into the scan state machine.
//!
//! Scan variants that need more than a different position sequence (sweeps,
//! time scans) implement [`ScanHooks`]. Every hook has a no-op default.

use async_trait::async_trait;
use scan_core::{Dataset, ScanResult};

use crate::control::ScanControl;
use crate::environment::{EnvChannel, SampleWindow};
use crate::motion::MoveCoordinator;

/// Whether the scan goes on after a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointFlow {
    /// Carry on
    Continue,
    /// End the scan normally, running EndScan
    StopScan,
}

/// What a hook may use while it runs.
pub struct HookContext<'a> {
    /// Moves with the run's failure policy
    pub moves: &'a MoveCoordinator,
    /// Stop and pause handle of the run
    pub control: &'a ScanControl,
}

/// Entry and exit hooks of the scan phases.
#[async_trait]
pub trait ScanHooks: Send + Sync {
    /// Before the first moves of PrepareScan.
    async fn before_prepare_scan(&self, _ctx: &HookContext<'_>) -> ScanResult<()> {
        Ok(())
    }

    /// After the sinks have seen the dataset header.
    async fn after_begin_scan(&self, _ctx: &HookContext<'_>, _dataset: &Dataset) -> ScanResult<()> {
        Ok(())
    }

    /// Before point `number` (1-based) is prepared.
    async fn before_prepare_point(
        &self,
        _ctx: &HookContext<'_>,
        _number: usize,
    ) -> ScanResult<PointFlow> {
        Ok(PointFlow::Continue)
    }

    /// After the point checkpoint of point `number`.
    async fn after_finish_point(
        &self,
        _ctx: &HookContext<'_>,
        _number: usize,
    ) -> ScanResult<PointFlow> {
        Ok(PointFlow::Continue)
    }

    /// Before the sinks are told the dataset ended.
    async fn before_end_scan(&self, _ctx: &HookContext<'_>) -> ScanResult<()> {
        Ok(())
    }

    /// Rewrite the environment values of a point before it is recorded.
    fn adjust_environment(
        &self,
        _channels: &[EnvChannel],
        _values: &mut [Option<f64>],
        _window: &SampleWindow,
    ) {
    }
}

/// Hooks of plain step scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl ScanHooks for NoHooks {}

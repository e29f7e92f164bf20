//! Sweeps and time scans.
//!
//! A sweep starts its devices towards their targets at the first point and
//! keeps counting until none of them is busy. Without devices it counts a
//! fixed number of points, or until stopped, with elapsed time recorded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scan_core::{Movable, ScanResult};
use tracing::{debug, info, warn};

use crate::hooks::{HookContext, PointFlow, ScanHooks};

/// Hooks driving the sweep devices.
pub struct SweepHooks {
    devices: Vec<Arc<dyn Movable>>,
    targets: Vec<(Arc<dyn Movable>, f64)>,
    delay: Option<Duration>,
}

impl SweepHooks {
    /// Sweep `devices` to `targets`, sleeping `delay` seconds between points.
    pub fn new(
        devices: Vec<Arc<dyn Movable>>,
        targets: Vec<(Arc<dyn Movable>, f64)>,
        delay: Option<f64>,
    ) -> Self {
        let delay = delay
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64);
        Self {
            devices,
            targets,
            delay,
        }
    }

    async fn any_busy(&self) -> bool {
        for dev in &self.devices {
            match dev.status().await {
                Ok(status) if status.is_busy() => return true,
                Ok(_) => {}
                Err(e) => warn!(device = %dev.name(), "Could not read sweep device status: {}", e),
            }
        }
        false
    }
}

#[async_trait]
impl ScanHooks for SweepHooks {
    async fn before_prepare_point(
        &self,
        ctx: &HookContext<'_>,
        number: usize,
    ) -> ScanResult<PointFlow> {
        if number == 1 {
            if self.targets.is_empty() {
                return Ok(PointFlow::Continue);
            }
            info!(devices = self.targets.len(), "Starting sweep");
            if !ctx.moves.start_devices(&self.targets).await? {
                warn!("Sweep could not be started, ending scan");
                return Ok(PointFlow::StopScan);
            }
        } else if let Some(delay) = self.delay {
            debug!(?delay, "Delay between points");
            ctx.control.sleep(delay).await?;
        }
        Ok(PointFlow::Continue)
    }

    async fn after_finish_point(
        &self,
        _ctx: &HookContext<'_>,
        _number: usize,
    ) -> ScanResult<PointFlow> {
        if !self.devices.is_empty() && !self.any_busy().await {
            info!("Sweep devices reached their targets");
            return Ok(PointFlow::StopScan);
        }
        Ok(PointFlow::Continue)
    }
}

//! Plan construction per scan variant.
//!
//! Every function returns a [`ScanPlanBuilder`] (or a variant-specific
//! builder) with the positions already generated; detectors, environment,
//! preset and multistep are added on the builder before `build(&ctx)`.

use std::sync::Arc;

use scan_core::{Movable, Preset, ScanResult};

use super::{ScanContext, ScanKind, ScanPlanBuilder};
use crate::continuous::ContinuousScanBuilder;
use crate::environment::EnvChannel;
use crate::manual::ManualScanBuilder;
use crate::positions::{
    AdaptiveSource, DecisionService, ListSource, MoveCostEstimator, RepeatSource,
};
use crate::sweep::SweepHooks;

/// `npoints` equidistant points per device, `start + i * step`.
pub fn range_scan(
    devices: Vec<Arc<dyn Movable>>,
    starts: &[f64],
    steps: &[f64],
    npoints: usize,
) -> ScanResult<ScanPlanBuilder> {
    let source = ListSource::equidistant(starts, steps, npoints)?;
    Ok(ScanPlanBuilder::new(ScanKind::Range, devices, Box::new(source)))
}

/// One device from `start` to `end` in steps of `step`.
pub fn range_scan_to(
    device: Arc<dyn Movable>,
    start: f64,
    step: f64,
    end: f64,
) -> ScanResult<ScanPlanBuilder> {
    let source = ListSource::equidistant_to_end(start, step, end)?;
    Ok(ScanPlanBuilder::new(ScanKind::Range, vec![device], Box::new(source)))
}

/// Explicit positions, one list per device.
pub fn list_scan(
    devices: Vec<Arc<dyn Movable>>,
    lists: Vec<Vec<f64>>,
) -> ScanResult<ScanPlanBuilder> {
    let source = ListSource::explicit(lists)?;
    Ok(ScanPlanBuilder::new(ScanKind::List, devices, Box::new(source)))
}

/// `2 * numperside + 1` points around the centers.
pub fn centered_scan(
    devices: Vec<Arc<dyn Movable>>,
    centers: &[f64],
    steps: &[f64],
    numperside: usize,
) -> ScanResult<ScanPlanBuilder> {
    let source = ListSource::centered(centers, steps, numperside)?;
    Ok(ScanPlanBuilder::new(ScanKind::Centered, devices, Box::new(source)))
}

/// Every `inner` position for each `outer` position; the sinks see a break
/// between rows.
pub fn grid_scan(
    outer_devices: Vec<Arc<dyn Movable>>,
    outer: ListSource,
    inner_devices: Vec<Arc<dyn Movable>>,
    inner: ListSource,
    snake: bool,
) -> ScanResult<ScanPlanBuilder> {
    let source = ListSource::grid(outer, inner, snake)?;
    let mut devices = outer_devices;
    devices.extend(inner_devices);
    Ok(ScanPlanBuilder::new(ScanKind::Grid, devices, Box::new(source)))
}

/// Count `npoints` times (forever with `None`), with elapsed time as the
/// first environment column.
///
/// A `delay` entry in `preset` is taken out and slept between points.
pub fn time_scan(npoints: Option<usize>, preset: Preset) -> ScanPlanBuilder {
    sweep(Vec::new(), npoints, preset)
}

/// Start every sweep device towards its end value and count until none of
/// them moves any more (or `npoints` points were taken).
///
/// Sweep devices with a start value are moved there first. Without sweep
/// devices this is a time scan.
pub fn sweep(
    sweeps: Vec<(Arc<dyn Movable>, Option<f64>, f64)>,
    npoints: Option<usize>,
    mut preset: Preset,
) -> ScanPlanBuilder {
    let source = match npoints {
        Some(n) => RepeatSource::counted(n),
        None => RepeatSource::infinite(),
    };
    let delay = preset.take("delay");

    let devices: Vec<Arc<dyn Movable>> = sweeps.iter().map(|(dev, _, _)| Arc::clone(dev)).collect();
    let first_moves = sweeps
        .iter()
        .filter_map(|(dev, start, _)| start.map(|s| (Arc::clone(dev), s)))
        .collect();
    let targets = sweeps
        .iter()
        .map(|(dev, _, end)| (Arc::clone(dev), *end))
        .collect();

    let (kind, leading) = if devices.is_empty() {
        (ScanKind::Time, vec![EnvChannel::ElapsedTime])
    } else {
        let channels = devices
            .iter()
            .map(|dev| EnvChannel::movable(Arc::clone(dev)))
            .collect();
        (ScanKind::Sweep, channels)
    };

    ScanPlanBuilder::new(kind, Vec::new(), Box::new(source))
        .first_moves(first_moves)
        .leading_environment(leading)
        .extra_devices(devices.clone())
        .hooks(Arc::new(SweepHooks::new(devices, targets, delay)))
        .preset(preset)
}

/// One device moving continuously from `start` to `end`.
pub fn continuous_scan(device: Arc<dyn Movable>, start: f64, end: f64) -> ContinuousScanBuilder {
    ContinuousScanBuilder::new(device, start, end)
}

/// Points taken one at a time by the caller.
pub fn manual_scan() -> ManualScanBuilder {
    ManualScanBuilder::new()
}

/// Positions decided one by one by `service`.
///
/// Retry budget and poll backoff come from the context's configuration.
pub fn adaptive_scan(
    ctx: &ScanContext,
    devices: Vec<Arc<dyn Movable>>,
    service: Box<dyn DecisionService>,
    estimator: Option<Arc<dyn MoveCostEstimator>>,
) -> ScanPlanBuilder {
    let mut source =
        AdaptiveSource::new(devices.clone(), service).with_config(&ctx.config.adaptive);
    if let Some(estimator) = estimator {
        source = source.with_estimator(estimator);
    }
    ScanPlanBuilder::new(ScanKind::Adaptive, devices, Box::new(source))
}

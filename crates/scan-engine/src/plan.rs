//! Scan plans: immutable descriptions of one scan invocation.
//!
//! A [`ScanPlan`] is validated when it is built, before any hardware is
//! touched. Defaults that a session would normally supply (detectors,
//! environment, sinks, configuration) come from an explicit [`ScanContext`].
//!
//! # Example
//!
//! ```rust,ignore
//! let ctx = ScanContext::new(EngineConfig::default())
//!     .with_detectors(vec![det])
//!     .with_sink(sink);
//!
//! let plan = builders::range_scan(vec![motor], &[0.0], &[0.5], 21)?
//!     .preset(Preset::new().with("t", 1.0))
//!     .build(&ctx)?;
//! ScanController::new(plan).run().await?;
//! ```

pub mod builders;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scan_core::limits::validate_point_count;
use scan_core::{Measurable, Movable, Preset, Readable, ScanError, ScanResult};
use tracing::warn;

use crate::config::EngineConfig;
use crate::environment::EnvChannel;
use crate::hooks::{NoHooks, ScanHooks};
use crate::manual::ManualScanSlot;
use crate::positions::{PositionSource, SourceLen};
use crate::sink::DataSink;

/// Closed set of scan variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// Equidistant steps
    Range,
    /// Explicit positions
    List,
    /// Steps on both sides of a center
    Centered,
    /// Cartesian product of two lists
    Grid,
    /// Counting without moving
    Time,
    /// Devices started once, points taken while they move
    Sweep,
    /// One device moving at reduced speed
    Continuous,
    /// Points taken on demand
    Manual,
    /// Positions chosen by a decision service
    Adaptive,
}

impl ScanKind {
    /// Short label stored in the dataset.
    pub fn label(&self) -> &'static str {
        match self {
            ScanKind::Range => "range",
            ScanKind::List => "list",
            ScanKind::Centered => "centered",
            ScanKind::Grid => "grid",
            ScanKind::Time => "time",
            ScanKind::Sweep => "sweep",
            ScanKind::Continuous => "continuous",
            ScanKind::Manual => "manual",
            ScanKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Speed and acceleration to use during the scan; restored afterwards.
#[derive(Clone)]
pub struct SpeedOverride {
    /// Device to override
    pub device: Arc<dyn Movable>,
    /// Speed during the scan
    pub speed: Option<f64>,
    /// Acceleration during the scan
    pub accel: Option<f64>,
}

impl fmt::Debug for SpeedOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeedOverride")
            .field("device", &self.device.name())
            .field("speed", &self.speed)
            .field("accel", &self.accel)
            .finish()
    }
}

/// A device stepped through its settings at every point.
#[derive(Clone)]
pub struct Multistep {
    /// Device to step
    pub device: Arc<dyn Movable>,
    /// One setting per sub-step
    pub settings: Vec<f64>,
}

/// Which environment channels a scan samples.
#[derive(Debug, Clone, Default)]
pub enum EnvironmentSelection {
    /// The context's default channels
    #[default]
    Default,
    /// The defaults plus these channels
    Extend(Vec<EnvChannel>),
    /// No environment at all
    Suppress,
}

/// Defaults and shared state for building plans.
#[derive(Clone)]
pub struct ScanContext {
    /// Default detectors
    pub detectors: Vec<Arc<dyn Measurable>>,
    /// Default environment channels
    pub environment: Vec<EnvChannel>,
    /// Devices whose `info()` goes into the dataset metadata
    pub metadata_devices: Vec<Arc<dyn Readable>>,
    /// Sinks every dataset goes to
    pub sinks: Vec<Arc<dyn DataSink>>,
    /// Engine configuration
    pub config: EngineConfig,
    counter: Arc<AtomicU64>,
    manual: ManualScanSlot,
}

impl ScanContext {
    /// Empty context with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            detectors: Vec::new(),
            environment: Vec::new(),
            metadata_devices: Vec::new(),
            sinks: Vec::new(),
            config,
            counter: Arc::new(AtomicU64::new(0)),
            manual: ManualScanSlot::default(),
        }
    }

    /// Default detectors of plans built from this context.
    pub fn with_detectors(mut self, detectors: Vec<Arc<dyn Measurable>>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Default environment channels.
    pub fn with_environment(mut self, environment: Vec<EnvChannel>) -> Self {
        self.environment = environment;
        self
    }

    /// Devices whose metadata is snapshotted at BeginScan.
    pub fn with_metadata_devices(mut self, devices: Vec<Arc<dyn Readable>>) -> Self {
        self.metadata_devices = devices;
        self
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Allocate the next scan number (1, 2, ...).
    pub fn next_scan_number(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Numbers allocated so far.
    pub fn scan_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Slot guarding against concurrent manual scans.
    pub fn manual_slot(&self) -> &ManualScanSlot {
        &self.manual
    }
}

/// Validated description of one scan.
pub struct ScanPlan {
    pub(crate) kind: ScanKind,
    pub(crate) description: String,
    pub(crate) devices: Vec<Arc<dyn Movable>>,
    pub(crate) source: Box<dyn PositionSource>,
    pub(crate) first_moves: Vec<(Arc<dyn Movable>, f64)>,
    pub(crate) multistep: Vec<Multistep>,
    pub(crate) detectors: Vec<Arc<dyn Measurable>>,
    pub(crate) environment: Vec<EnvChannel>,
    pub(crate) preset: Preset,
    pub(crate) speed_overrides: Vec<SpeedOverride>,
    pub(crate) extra_devices: Vec<Arc<dyn Movable>>,
    pub(crate) hooks: Arc<dyn ScanHooks>,
    pub(crate) sink_info: BTreeMap<String, String>,
    pub(crate) context: ScanContext,
}

impl fmt::Debug for ScanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPlan")
            .field("kind", &self.kind)
            .field("devices", &self.device_names())
            .field("detectors", &self.detectors.len())
            .field("environment", &self.environment)
            .field("preset", &self.preset)
            .field("len", &self.source.len_hint())
            .finish()
    }
}

impl ScanPlan {
    /// Scan variant.
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// Free-text description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Names of the scanned devices, in column order.
    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name()).collect()
    }

    /// Detectors counted at every point.
    pub fn detectors(&self) -> &[Arc<dyn Measurable>] {
        &self.detectors
    }

    /// Environment channels sampled at every point.
    pub fn environment(&self) -> &[EnvChannel] {
        &self.environment
    }

    /// Counting preset of every point.
    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    /// Expected number of points.
    pub fn len_hint(&self) -> SourceLen {
        self.source.len_hint()
    }

    /// Sub-steps per point (1 without multistep).
    pub fn multistep_count(&self) -> usize {
        self.multistep.first().map_or(1, |m| m.settings.len())
    }
}

/// Builder for [`ScanPlan`]; see [`builders`] for the per-variant entry points.
pub struct ScanPlanBuilder {
    kind: ScanKind,
    description: String,
    devices: Vec<Arc<dyn Movable>>,
    source: Box<dyn PositionSource>,
    first_moves: Vec<(Arc<dyn Movable>, f64)>,
    multistep: Vec<Multistep>,
    detectors: Option<Vec<Arc<dyn Measurable>>>,
    environment: EnvironmentSelection,
    leading_environment: Vec<EnvChannel>,
    preset: Preset,
    speed_overrides: Vec<SpeedOverride>,
    extra_devices: Vec<Arc<dyn Movable>>,
    hooks: Arc<dyn ScanHooks>,
    sink_info: BTreeMap<String, String>,
}

impl ScanPlanBuilder {
    /// Plan of `kind` moving `devices` through `source`.
    pub fn new(
        kind: ScanKind,
        devices: Vec<Arc<dyn Movable>>,
        source: Box<dyn PositionSource>,
    ) -> Self {
        Self {
            kind,
            description: String::new(),
            devices,
            source,
            first_moves: Vec::new(),
            multistep: Vec::new(),
            detectors: None,
            environment: EnvironmentSelection::Default,
            leading_environment: Vec::new(),
            preset: Preset::new(),
            speed_overrides: Vec::new(),
            extra_devices: Vec::new(),
            hooks: Arc::new(NoHooks),
            sink_info: BTreeMap::new(),
        }
    }

    /// Free-text description stored in the dataset.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Move these devices before the scanned devices go to the first position.
    pub fn first_moves(mut self, moves: Vec<(Arc<dyn Movable>, f64)>) -> Self {
        self.first_moves.extend(moves);
        self
    }

    /// Step `device` through `settings` at every point.
    pub fn multistep(mut self, device: Arc<dyn Movable>, settings: Vec<f64>) -> Self {
        self.multistep.push(Multistep { device, settings });
        self
    }

    /// Detectors to use instead of the context's defaults.
    pub fn detectors(mut self, detectors: Vec<Arc<dyn Measurable>>) -> Self {
        self.detectors = Some(detectors);
        self
    }

    /// Environment channels to sample.
    pub fn environment(mut self, selection: EnvironmentSelection) -> Self {
        self.environment = selection;
        self
    }

    pub(crate) fn leading_environment(mut self, channels: Vec<EnvChannel>) -> Self {
        self.leading_environment = channels;
        self
    }

    /// Counting preset of every point.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    /// Override a speed or acceleration for the duration of the scan.
    pub fn speed_override(mut self, over: SpeedOverride) -> Self {
        self.speed_overrides.push(over);
        self
    }

    /// Devices driven by hooks rather than by the position source.
    pub(crate) fn extra_devices(mut self, devices: Vec<Arc<dyn Movable>>) -> Self {
        self.extra_devices.extend(devices);
        self
    }

    /// Hooks of the scan variant.
    pub fn hooks(mut self, hooks: Arc<dyn ScanHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Free-form entry handed to the sinks (e.g. `continuation`).
    pub fn sink_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sink_info.insert(key.into(), value.into());
        self
    }

    fn check_structure(&self) -> ScanResult<()> {
        if let Some(arity) = self.source.arity() {
            if arity != self.devices.len() {
                return Err(ScanError::Config(format!(
                    "positions have {} values but {} devices are scanned",
                    arity,
                    self.devices.len()
                )));
            }
        }

        if let Some(first) = self.multistep.first() {
            let count = first.settings.len();
            if count == 0 {
                return Err(ScanError::Config(
                    "multistep settings must not be empty".to_string(),
                ));
            }
            if let Some(bad) = self.multistep.iter().find(|m| m.settings.len() != count) {
                return Err(ScanError::Config(format!(
                    "multistep settings of {} have {} entries, expected {}",
                    bad.device.name(),
                    bad.settings.len(),
                    count
                )));
            }
        }

        let mut names = HashSet::new();
        let all = self
            .devices
            .iter()
            .chain(self.multistep.iter().map(|m| &m.device));
        for dev in all {
            if !names.insert(dev.name()) {
                return Err(ScanError::Config(format!(
                    "device {} is scanned more than once",
                    dev.name()
                )));
            }
        }

        if let SourceLen::Known(n) = self.source.len_hint() {
            if n == 0 {
                return Err(ScanError::Config("scan has no positions".to_string()));
            }
        }
        Ok(())
    }

    fn resolve_environment(&mut self, ctx: &ScanContext) -> Vec<EnvChannel> {
        let mut channels = std::mem::take(&mut self.leading_environment);
        let rest = match std::mem::take(&mut self.environment) {
            EnvironmentSelection::Suppress => Vec::new(),
            EnvironmentSelection::Default => ctx.environment.clone(),
            EnvironmentSelection::Extend(extra) => {
                let mut all = ctx.environment.clone();
                all.extend(extra);
                all
            }
        };
        for channel in rest {
            if !channels.iter().any(|c| c.name() == channel.name()) {
                channels.push(channel);
            }
        }
        channels
    }

    /// Validate and finish the plan.
    ///
    /// Structural problems are [`ScanError::Config`]; a missing detector set
    /// or preset keys no detector understands only produce warnings.
    pub fn build(mut self, ctx: &ScanContext) -> ScanResult<ScanPlan> {
        self.check_structure()?;
        if let SourceLen::Known(npoints) = self.source.len_hint() {
            validate_point_count(npoints, ctx.config.limits.max_points)?;
        }

        let detectors = self
            .detectors
            .take()
            .unwrap_or_else(|| ctx.detectors.clone());
        if detectors.is_empty() {
            warn!(kind = %self.kind, "Scanning without detectors");
        } else if !self.preset.is_empty() {
            let known: Vec<String> = detectors.iter().flat_map(|d| d.preset_keys()).collect();
            let unknown = self.preset.unrecognized(&known);
            if !unknown.is_empty() {
                let names: Vec<&str> = detectors.iter().map(|d| d.name()).collect();
                warn!(
                    keys = ?unknown,
                    detectors = ?names,
                    "Preset keys not recognized by any detector"
                );
            }
        }

        let environment = self.resolve_environment(ctx);

        Ok(ScanPlan {
            kind: self.kind,
            description: self.description,
            devices: self.devices,
            source: self.source,
            first_moves: self.first_moves,
            multistep: self.multistep,
            detectors,
            environment,
            preset: self.preset,
            speed_overrides: self.speed_overrides,
            extra_devices: self.extra_devices,
            hooks: self.hooks,
            sink_info: self.sink_info,
            context: ctx.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::{ListSource, RepeatSource};
    use scan_mock::{MockDetector, MockMotor, MockSensor};
    use tracing_test::traced_test;

    fn motor(name: &str) -> Arc<dyn Movable> {
        Arc::new(MockMotor::new(name))
    }

    fn ctx() -> ScanContext {
        ScanContext::new(EngineConfig::default())
            .with_detectors(vec![Arc::new(MockDetector::new("det"))])
            .with_environment(vec![EnvChannel::Device(Arc::new(MockSensor::new(
                "T", "K", 300.0,
            )))])
    }

    fn list(lists: Vec<Vec<f64>>) -> Box<dyn PositionSource> {
        Box::new(ListSource::explicit(lists).unwrap())
    }

    #[test]
    fn arity_must_match_devices() {
        let err = ScanPlanBuilder::new(
            ScanKind::List,
            vec![motor("a")],
            list(vec![vec![1.0], vec![2.0]]),
        )
        .build(&ctx())
        .unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let a = motor("a");
        let err = ScanPlanBuilder::new(ScanKind::List, vec![a.clone()], list(vec![vec![1.0]]))
            .multistep(a, vec![1.0, 2.0])
            .build(&ctx())
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn multistep_lengths_must_agree() {
        let err = ScanPlanBuilder::new(ScanKind::List, vec![motor("a")], list(vec![vec![1.0]]))
            .multistep(motor("b"), vec![1.0, 2.0])
            .multistep(motor("c"), vec![1.0])
            .build(&ctx())
            .unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));

        let err = ScanPlanBuilder::new(ScanKind::List, vec![motor("a")], list(vec![vec![1.0]]))
            .multistep(motor("b"), vec![])
            .build(&ctx())
            .unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }

    #[test]
    fn environment_selection() {
        let ctx = ctx();
        let extra = EnvChannel::Device(Arc::new(MockSensor::new("B", "T", 1.0)));
        let names = |sel: EnvironmentSelection| -> Vec<String> {
            ScanPlanBuilder::new(ScanKind::Time, vec![], Box::new(RepeatSource::counted(1)))
                .environment(sel)
                .build(&ctx)
                .unwrap()
                .environment()
                .iter()
                .map(EnvChannel::name)
                .collect()
        };
        assert_eq!(names(EnvironmentSelection::Default), vec!["T"]);
        assert_eq!(names(EnvironmentSelection::Suppress), Vec::<String>::new());
        assert_eq!(
            names(EnvironmentSelection::Extend(vec![extra.clone(), extra])),
            vec!["T", "B"]
        );
    }

    #[traced_test]
    #[test]
    fn empty_detectors_and_unknown_presets_only_warn() {
        let plan = ScanPlanBuilder::new(ScanKind::Time, vec![], Box::new(RepeatSource::counted(1)))
            .detectors(vec![])
            .build(&ctx())
            .unwrap();
        assert!(plan.detectors().is_empty());
        assert!(logs_contain("Scanning without detectors"));

        ScanPlanBuilder::new(ScanKind::Time, vec![], Box::new(RepeatSource::counted(1)))
            .preset(Preset::new().with("t", 1.0).with("mon2", 5.0))
            .build(&ctx())
            .unwrap();
        assert!(logs_contain("Preset keys not recognized"));
        assert!(logs_contain("mon2"));
    }

    #[test]
    fn configured_point_limit_applies() {
        let mut config = EngineConfig::default();
        config.limits.max_points = 5;
        let ctx = ScanContext::new(config);
        let lists: Vec<Vec<f64>> = (0..11).map(|i| vec![f64::from(i)]).collect();

        let err = ScanPlanBuilder::new(ScanKind::List, vec![motor("a")], list(lists))
            .build(&ctx)
            .unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
        assert!(err.to_string().contains("max 5"));

        // unbounded sources are stopped from outside
        ScanPlanBuilder::new(ScanKind::Time, vec![], Box::new(RepeatSource::infinite()))
            .build(&ctx)
            .unwrap();
    }

    #[test]
    fn scan_numbers_are_shared_between_clones() {
        let ctx = ctx();
        let other = ctx.clone();
        assert_eq!(ctx.next_scan_number(), 1);
        assert_eq!(other.next_scan_number(), 2);
        assert_eq!(ctx.scan_count(), 2);
    }
}

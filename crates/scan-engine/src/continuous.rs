//! Continuous scans: one device moves at reduced speed while the detectors
//! count, and a point is taken every `timedelta`.
//!
//! Each point carries the midpoint of the device position over the interval
//! and the detector counts accumulated during it. The speed is restored,
//! and device and detectors stopped, however the scan ends.
//!
//! Counts are raw differences of cumulative readings; a counter that went
//! backwards shows up as a negative value and a warning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scan_core::{Dataset, Measurable, Movable, Operation, Preset, ScanError, ScanResult};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::acquisition::CountLoop;
use crate::control::{Checkpoint, ScanControl};
use crate::controller::{ScanPhase, ScanRun};
use crate::motion::{DefaultFailurePolicy, FailurePolicy};
use crate::plan::{
    EnvironmentSelection, ScanContext, ScanKind, ScanPlan, ScanPlanBuilder, SpeedOverride,
};
use crate::positions::ListSource;

/// Minimum detector preset of a continuous scan, in seconds.
const MIN_COUNT_TIME: f64 = 3600.0;

/// Builder for [`ContinuousScan`].
pub struct ContinuousScanBuilder {
    device: Arc<dyn Movable>,
    start: f64,
    end: f64,
    speed: Option<f64>,
    timedelta: Option<Duration>,
    description: String,
    detectors: Option<Vec<Arc<dyn Measurable>>>,
    environment: EnvironmentSelection,
    sink_info: Vec<(String, String)>,
    policy: Arc<dyn FailurePolicy>,
}

impl ContinuousScanBuilder {
    /// Move `device` from `start` to `end`.
    pub fn new(device: Arc<dyn Movable>, start: f64, end: f64) -> Self {
        Self {
            device,
            start,
            end,
            speed: None,
            timedelta: None,
            description: String::new(),
            detectors: None,
            environment: EnvironmentSelection::Default,
            sink_info: Vec::new(),
            policy: Arc::new(DefaultFailurePolicy),
        }
    }

    /// Speed of the sweep; default is the device speed divided by the
    /// configured divisor.
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Interval between points; default from the configuration.
    pub fn timedelta(mut self, timedelta: Duration) -> Self {
        self.timedelta = Some(timedelta);
        self
    }

    /// Free-text description stored in the dataset.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
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

    /// Free-form entry handed to the sinks.
    pub fn sink_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sink_info.push((key.into(), value.into()));
        self
    }

    /// Failure policy of the run.
    pub fn policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the scan against `ctx`.
    pub fn build(self, ctx: &ScanContext) -> ScanResult<ContinuousScan> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(ScanError::Config(format!(
                "continuous scan bounds must be finite, got {} to {}",
                self.start, self.end
            )));
        }
        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(ScanError::Config(format!(
                    "continuous scan speed must be positive, got {}",
                    speed
                )));
            }
        }
        let timedelta = self.timedelta.unwrap_or(ctx.config.continuous.timedelta);
        if timedelta.is_zero() {
            return Err(ScanError::Config(
                "continuous scan interval must not be zero".to_string(),
            ));
        }

        let source = ListSource::explicit(vec![vec![self.start]])?;
        let mut plan = ScanPlanBuilder::new(
            ScanKind::Continuous,
            vec![Arc::clone(&self.device)],
            Box::new(source),
        )
        .description(self.description)
        .environment(self.environment);
        if let Some(detectors) = self.detectors {
            plan = plan.detectors(detectors);
        }
        for (key, value) in self.sink_info {
            plan = plan.sink_info(key, value);
        }

        Ok(ContinuousScan {
            plan: Some(plan.build(ctx)?),
            device: self.device,
            start: self.start,
            end: self.end,
            speed: self.speed,
            speed_divisor: ctx.config.continuous.speed_divisor,
            timedelta,
            policy: self.policy,
            control: ScanControl::new(),
            phase: watch::channel(ScanPhase::Idle).0,
            dataset: None,
        })
    }
}

/// A continuous scan ready to run.
pub struct ContinuousScan {
    plan: Option<ScanPlan>,
    device: Arc<dyn Movable>,
    start: f64,
    end: f64,
    speed: Option<f64>,
    speed_divisor: f64,
    timedelta: Duration,
    policy: Arc<dyn FailurePolicy>,
    control: ScanControl,
    phase: watch::Sender<ScanPhase>,
    dataset: Option<Dataset>,
}

impl ContinuousScan {
    /// Stop/pause handle; clone it before `run()`.
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    /// Follow phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<ScanPhase> {
        self.phase.subscribe()
    }

    /// The dataset of the finished run, if it got as far as BeginScan.
    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref().filter(|d| d.number > 0)
    }

    /// Run the scan once.
    ///
    /// Both ends are checked against the device limits before anything
    /// moves; a refused end is fatal.
    pub async fn run(&mut self) -> ScanResult<()> {
        let plan = self.plan.take().ok_or(ScanError::AlreadyRun)?;
        let span = info_span!("scan", kind = %ScanKind::Continuous, device = %self.device.name());
        let acquisition = Arc::new(CountLoop::new(plan.context.config.count_loop_delay));
        let (mut run, _source) = ScanRun::new(
            plan,
            acquisition,
            Arc::clone(&self.policy),
            self.control.clone(),
            self.phase.clone(),
        );
        run.npoints = 0;

        let result = self.execute(&mut run).instrument(span).await;
        if let Err(e) = &result {
            if e.is_cancellation() {
                info!("Continuous scan stopped: {}", e);
            } else {
                warn!("Continuous scan failed: {}", e);
            }
        }
        self.dataset = Some(run.into_dataset());
        result
    }

    async fn execute(&self, run: &mut ScanRun) -> ScanResult<()> {
        for target in [self.start, self.end] {
            self.device
                .is_allowed(target)
                .await
                .map_err(|e| ScanError::device(Operation::Move, Some(target), e))?;
        }
        let speed = self.sweep_speed().await?;

        let (can_measure, _) = run.prepare_scan(Some(&[self.start])).await?;
        if !can_measure {
            warn!(start = self.start, "Start position not reached, nothing measured");
            return Ok(());
        }

        if let Err(e) = run.begin_scan().await {
            return Err(run.end_after_failed_begin(e).await);
        }
        let swept = self.sweep(run, speed).await;
        let cleaned = self.cleanup(run).await;
        swept.and(cleaned)?;
        run.control.breakpoint(Checkpoint::Run).await
    }

    // Explicit speed, or the device speed divided by the configured divisor.
    async fn sweep_speed(&self) -> ScanResult<f64> {
        let Some(speed) = self.speed else {
            let current = self
                .device
                .speed()
                .await
                .map_err(|e| ScanError::device(Operation::Prepare, None, e))?;
            let speed = current / self.speed_divisor;
            if !speed.is_finite() || speed <= 0.0 {
                return Err(ScanError::Config(format!(
                    "{} reports speed {}, give the continuous scan an explicit speed",
                    self.device.name(),
                    current
                )));
            }
            return Ok(speed);
        };
        Ok(speed)
    }

    async fn sweep(&self, run: &mut ScanRun, speed: f64) -> ScanResult<()> {
        run.apply_override(SpeedOverride {
            device: Arc::clone(&self.device),
            speed: Some(speed),
            accel: None,
        })
        .await?;

        run.set_phase(ScanPhase::Move);
        if !run
            .moves
            .start_devices(&[(Arc::clone(&self.device), self.end)])
            .await?
        {
            warn!(end = self.end, "Sweep could not be started");
            return Ok(());
        }

        let count_time = ((self.end - self.start).abs() / speed * 5.0).max(MIN_COUNT_TIME);
        let preset = Preset::new().with("t", count_time);
        run.set_phase(ScanPhase::Acquire);
        for det in &run.detectors {
            det.set_preset(&preset)
                .await
                .map_err(|e| ScanError::device(Operation::Count, None, e))?;
            det.start()
                .await
                .map_err(|e| ScanError::device(Operation::Count, None, e))?;
        }
        debug!(speed, count_time, "Sweep started");

        let mut last = read_detectors(run).await?.unwrap_or_default();
        let mut last_pos = self.start;
        let mut last_time = Utc::now();
        let mut number = 0;

        while self.device_busy(run).await? {
            run.control.sleep(self.timedelta).await?;
            run.control.breakpoint(Checkpoint::Point).await?;

            let now = Utc::now();
            let position = match self.device.read().await {
                Ok(values) => values.first().copied().unwrap_or(last_pos),
                Err(e) => {
                    run.moves.errors().handle(Operation::Read, None, e).await?;
                    continue;
                }
            };
            let Some(readings) = read_detectors(run).await? else {
                continue;
            };

            let mut xs = vec![Some((last_pos + position) / 2.0)];
            xs.extend(run.read_environment(last_time, now).await?);
            let diffs = count_differences(&readings, &last);
            if diffs.iter().any(|d| *d < 0.0) {
                warn!(point = number + 1, ?diffs, "Detector counts went backwards");
            }

            number += 1;
            run.dataset.current_point = number;
            run.record_point(number, xs, diffs, last_time, now).await?;

            last = readings;
            last_pos = position;
            last_time = now;
        }

        if let Err(e) = self.device.wait().await {
            run.moves
                .errors()
                .handle(Operation::Wait, Some(self.end), e)
                .await?;
        }
        info!(points = number, "Sweep finished");
        Ok(())
    }

    async fn device_busy(&self, run: &ScanRun) -> ScanResult<bool> {
        match self.device.status().await {
            Ok(status) => Ok(status.is_busy()),
            Err(e) => {
                run.moves.errors().handle(Operation::Read, None, e).await?;
                Ok(false)
            }
        }
    }

    async fn cleanup(&self, run: &mut ScanRun) -> ScanResult<()> {
        for det in &run.detectors {
            if let Err(e) = det.stop().await {
                warn!(device = %det.name(), "Could not stop detector: {}", e);
            }
        }
        if let Err(e) = self.device.stop().await {
            warn!(device = %self.device.name(), "Could not stop device: {}", e);
        }
        if let Err(e) = self.device.wait().await {
            warn!(device = %self.device.name(), "Device did not settle: {}", e);
        }
        let restored = run.restore_overrides().await;
        let ended = run.end_scan().await;
        restored.and(ended)
    }
}

// Counts accumulated since the previous reading; a value missing from the
// previous reading counts from zero.
fn count_differences(readings: &[f64], last: &[f64]) -> Vec<f64> {
    readings
        .iter()
        .zip(last.iter().chain(std::iter::repeat(&0.0)))
        .map(|(new, old)| new - old)
        .collect()
}

// Concatenated readings, or `None` if a read failed without aborting.
async fn read_detectors(run: &ScanRun) -> ScanResult<Option<Vec<f64>>> {
    let mut values = Vec::new();
    for det in &run.detectors {
        match det.read().await {
            Ok(v) => values.extend(v),
            Err(e) => {
                run.moves.errors().handle(Operation::Read, None, e).await?;
                return Ok(None);
            }
        }
    }
    Ok(Some(values))
}

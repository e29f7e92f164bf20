//! Scan controller: the state machine shared by every scan variant.
//!
//! # State Machine
//!
//! ```text
//! Idle → PrepareScan → BeginScan ─┬→ PreparePoint → Move → Acquire → RecordPoint ─┐
//!                                 │                                                ↓
//!                                 └────────────────── FinishPoint ←────────────────┘
//!                                                         │
//!                                                         ↓
//!                                                      EndScan → Idle
//! ```
//!
//! - A fatal failure during PrepareScan ends the run before any dataset exists.
//! - Once BeginScan ran, EndScan always runs, whatever happens to the points.
//! - FinishPoint runs for every point, skipped or not; it is where stop and
//!   pause requests are honoured.
//! - Speed and acceleration overrides are restored on every exit path.
//!
//! The steps live on [`ScanRun`] so that manual and continuous scans, which
//! drive the points themselves, share them with the standard loop in
//! [`ScanController::run`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scan_core::{
    Dataset, InfoCategory, InfoEntry, Measurable, Movable, Operation, PointRecord, Preset,
    Readable, ScanError, ScanResult, ValueInfo,
};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::acquisition::{Acquisition, CountLoop};
use crate::control::{Checkpoint, ScanControl};
use crate::environment::{read_environment, EnvChannel, SampleWindow};
use crate::hooks::{HookContext, PointFlow, ScanHooks};
use crate::motion::{DefaultFailurePolicy, ErrorHandler, FailurePolicy, MoveCoordinator};
use crate::plan::{Multistep, ScanContext, ScanKind, ScanPlan, SpeedOverride};
use crate::positions::{PositionSource, SourceStep};

/// Phase of a scan, observable while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// No scan running
    Idle,
    /// First moves and the move to the start position
    PrepareScan,
    /// Dataset header and sink notification
    BeginScan,
    /// Detectors armed for the next point
    PreparePoint,
    /// Devices moving to the next point
    Move,
    /// Detectors counting
    Acquire,
    /// Point stored and sent to the sinks
    RecordPoint,
    /// End-of-point checkpoint
    FinishPoint,
    /// Dataset closed and sinks notified
    EndScan,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanPhase::Idle => "idle",
            ScanPhase::PrepareScan => "prepare_scan",
            ScanPhase::BeginScan => "begin_scan",
            ScanPhase::PreparePoint => "prepare_point",
            ScanPhase::Move => "move",
            ScanPhase::Acquire => "acquire",
            ScanPhase::RecordPoint => "record_point",
            ScanPhase::FinishPoint => "finish_point",
            ScanPhase::EndScan => "end_scan",
        };
        f.write_str(name)
    }
}

// Original value of an overridden speed or acceleration.
struct AppliedOverride {
    device: Arc<dyn Movable>,
    speed: Option<f64>,
    accel: Option<f64>,
}

pub(crate) enum AcquireFailure {
    /// Failure of the count itself, still to be classified
    Count(ScanError),
    /// Already classified as fatal (multistep moves)
    Fatal(ScanError),
}

struct Acquired {
    ys: Vec<f64>,
    failure: Option<AcquireFailure>,
}

/// Per-run state and the steps of the state machine.
pub(crate) struct ScanRun {
    pub(crate) kind: ScanKind,
    description: String,
    pub(crate) devices: Vec<Arc<dyn Movable>>,
    first_moves: Vec<(Arc<dyn Movable>, f64)>,
    multistep: Vec<Multistep>,
    pub(crate) detectors: Vec<Arc<dyn Measurable>>,
    environment: Vec<EnvChannel>,
    pub(crate) preset: Preset,
    speed_overrides: Vec<SpeedOverride>,
    hooks: Arc<dyn ScanHooks>,
    sink_info: BTreeMap<String, String>,
    pub(crate) context: ScanContext,
    pub(crate) moves: MoveCoordinator,
    acquisition: Arc<dyn Acquisition>,
    pub(crate) control: ScanControl,
    phase: watch::Sender<ScanPhase>,
    pub(crate) dataset: Dataset,
    pub(crate) npoints: usize,
    applied: Vec<AppliedOverride>,
    run_started: DateTime<Utc>,
}

impl ScanRun {
    /// Split a plan into the run state and its position source.
    pub(crate) fn new(
        plan: ScanPlan,
        acquisition: Arc<dyn Acquisition>,
        policy: Arc<dyn FailurePolicy>,
        control: ScanControl,
        phase: watch::Sender<ScanPhase>,
    ) -> (Self, Box<dyn PositionSource>) {
        let mut movables: Vec<Arc<dyn Movable>> = Vec::new();
        let candidates = plan
            .devices
            .iter()
            .chain(plan.first_moves.iter().map(|(dev, _)| dev))
            .chain(plan.multistep.iter().map(|m| &m.device))
            .chain(plan.extra_devices.iter())
            .chain(plan.speed_overrides.iter().map(|o| &o.device));
        for dev in candidates {
            if !movables.iter().any(|m| m.name() == dev.name()) {
                movables.push(Arc::clone(dev));
            }
        }
        let errors = Arc::new(ErrorHandler::new(
            policy,
            movables,
            plan.detectors.clone(),
        ));

        let npoints = plan.source.len_hint().npoints();
        let run = Self {
            kind: plan.kind,
            dataset: Dataset::new(0, plan.kind.label(), plan.description.clone()),
            description: plan.description,
            devices: plan.devices,
            first_moves: plan.first_moves,
            multistep: plan.multistep,
            detectors: plan.detectors,
            environment: plan.environment,
            preset: plan.preset,
            speed_overrides: plan.speed_overrides,
            hooks: plan.hooks,
            sink_info: plan.sink_info,
            context: plan.context,
            moves: MoveCoordinator::new(errors),
            acquisition,
            control,
            phase,
            npoints,
            applied: Vec::new(),
            run_started: Utc::now(),
        };
        (run, plan.source)
    }

    pub(crate) fn set_phase(&self, phase: ScanPhase) {
        debug!(phase = %phase, "Entering phase");
        self.phase.send_replace(phase);
    }

    fn hook_ctx(&self) -> HookContext<'_> {
        HookContext {
            moves: &self.moves,
            control: &self.control,
        }
    }

    pub(crate) fn pairs(&self, position: &[f64]) -> Vec<(Arc<dyn Movable>, f64)> {
        self.devices
            .iter()
            .cloned()
            .zip(position.iter().copied())
            .collect()
    }

    /// Apply the plan's speed overrides, remembering the originals.
    pub(crate) async fn apply_overrides(&mut self) -> ScanResult<()> {
        for over in self.speed_overrides.clone() {
            self.apply_override(over).await?;
        }
        Ok(())
    }

    pub(crate) async fn apply_override(&mut self, over: SpeedOverride) -> ScanResult<()> {
        let dev = over.device;
        if let Some(speed) = over.speed {
            let original = dev
                .speed()
                .await
                .map_err(|e| ScanError::device(Operation::Prepare, Some(speed), e))?;
            dev.set_speed(speed)
                .await
                .map_err(|e| ScanError::device(Operation::Prepare, Some(speed), e))?;
            debug!(device = %dev.name(), from = original, to = speed, "Speed overridden");
            self.applied.push(AppliedOverride {
                device: Arc::clone(&dev),
                speed: Some(original),
                accel: None,
            });
        }
        if let Some(accel) = over.accel {
            let original = dev
                .accel()
                .await
                .map_err(|e| ScanError::device(Operation::Prepare, Some(accel), e))?;
            dev.set_accel(accel)
                .await
                .map_err(|e| ScanError::device(Operation::Prepare, Some(accel), e))?;
            debug!(device = %dev.name(), from = original, to = accel, "Acceleration overridden");
            self.applied.push(AppliedOverride {
                device: dev,
                speed: None,
                accel: Some(original),
            });
        }
        Ok(())
    }

    /// Put back every overridden speed and acceleration, newest first.
    pub(crate) async fn restore_overrides(&mut self) -> ScanResult<()> {
        let mut result = Ok(());
        while let Some(applied) = self.applied.pop() {
            let dev = &applied.device;
            let restored = match (applied.speed, applied.accel) {
                (Some(speed), _) => dev.set_speed(speed).await.map(|()| speed),
                (None, Some(accel)) => dev.set_accel(accel).await.map(|()| accel),
                (None, None) => continue,
            };
            match restored {
                Ok(value) => debug!(device = %dev.name(), value, "Override restored"),
                Err(e) => {
                    warn!(device = %dev.name(), "Could not restore speed/acceleration: {}", e);
                    if result.is_ok() {
                        result = Err(ScanError::device(Operation::Prepare, None, e));
                    }
                }
            }
        }
        result
    }

    /// First moves, then the scanned devices to `position`.
    ///
    /// Returns whether the first point can be measured and the values the
    /// devices reported when they arrived.
    pub(crate) async fn prepare_scan(
        &mut self,
        position: Option<&[f64]>,
    ) -> ScanResult<(bool, BTreeMap<String, Vec<f64>>)> {
        self.set_phase(ScanPhase::PrepareScan);
        self.hooks.before_prepare_scan(&self.hook_ctx()).await?;

        if !self.first_moves.is_empty() {
            info!(devices = self.first_moves.len(), "Moving to start");
            let outcome = self.moves.move_devices(&self.first_moves).await?;
            if !outcome.proceed {
                return Ok((false, BTreeMap::new()));
            }
        }
        match position {
            Some(position) if !self.devices.is_empty() => {
                let outcome = self.moves.move_devices(&self.pairs(position)).await?;
                Ok((outcome.proceed, outcome.values))
            }
            _ => Ok((true, BTreeMap::new())),
        }
    }

    fn y_info(&self) -> Vec<ValueInfo> {
        let base: Vec<ValueInfo> = self
            .detectors
            .iter()
            .flat_map(|det| det.value_info())
            .collect();
        let Some(first) = self.multistep.first() else {
            return base;
        };

        let mut info = Vec::with_capacity(base.len() * first.settings.len());
        for step in 0..first.settings.len() {
            let suffix: String = self
                .multistep
                .iter()
                .map(|m| format!("_{}_{}", m.device.name(), m.settings[step]))
                .collect();
            for value in &base {
                info.push(ValueInfo::new(
                    format!("{}{}", value.name, suffix),
                    value.unit.clone(),
                ));
            }
        }
        info
    }

    /// Dataset header, metadata snapshot and sink notification.
    pub(crate) async fn begin_scan(&mut self) -> ScanResult<()> {
        self.set_phase(ScanPhase::BeginScan);

        let number = self.context.next_scan_number();
        let mut dataset = Dataset::new(number, self.kind.label(), self.description.clone());
        let env_info: Vec<ValueInfo> = self
            .environment
            .iter()
            .flat_map(EnvChannel::value_info)
            .collect();
        dataset.x_info = self.devices.iter().flat_map(|d| d.value_info()).collect();
        dataset.env_count = env_info.len();
        dataset.x_info.extend(env_info);
        dataset.y_info = self.y_info();
        dataset.preset = self.preset.clone();
        dataset.npoints = self.npoints;
        dataset.sink_info = self.sink_info.clone();
        dataset.metadata = collect_metadata(&self.context.metadata_devices).await;
        self.dataset = dataset;

        for sink in &self.context.sinks {
            sink.prepare_dataset(&self.dataset).await?;
        }
        for sink in &self.context.sinks {
            sink.begin_dataset(&self.dataset).await?;
        }
        for category in InfoCategory::ALL {
            let Some(entries) = self.dataset.metadata.get(&category) else {
                continue;
            };
            for sink in &self.context.sinks {
                sink.add_info(&self.dataset, category, entries).await?;
            }
        }
        self.hooks
            .after_begin_scan(&self.hook_ctx(), &self.dataset)
            .await?;

        info!(
            number,
            uid = %self.dataset.uid,
            npoints = self.npoints,
            x = ?self.dataset.x_names(),
            y = ?self.dataset.y_names(),
            "Scan started"
        );
        Ok(())
    }

    /// Arm the detectors for point `number` and wait until they are idle.
    ///
    /// Returns `false` if the point has to be skipped.
    pub(crate) async fn prepare_point(&mut self, number: usize) -> ScanResult<bool> {
        self.set_phase(ScanPhase::PreparePoint);
        self.dataset.current_point = number;

        for det in &self.detectors {
            if let Err(e) = det.prepare().await {
                self.moves.errors().handle(Operation::Prepare, None, e).await?;
                return Ok(false);
            }
        }
        loop {
            let mut busy = false;
            for det in &self.detectors {
                match det.status().await {
                    Ok(status) => busy |= status.is_busy(),
                    Err(e) => {
                        self.moves.errors().handle(Operation::Prepare, None, e).await?;
                        return Ok(false);
                    }
                }
            }
            if !busy {
                return Ok(true);
            }
            self.control
                .sleep(self.context.config.count_loop_delay)
                .await?;
        }
    }

    async fn acquire(&mut self, preset: &Preset) -> Acquired {
        self.set_phase(ScanPhase::Acquire);
        if self.multistep.is_empty() {
            return match self
                .acquisition
                .measure(&self.detectors, preset, &self.control)
                .await
            {
                Ok(ys) => Acquired { ys, failure: None },
                Err(f) => Acquired {
                    ys: f.partial,
                    failure: Some(AcquireFailure::Count(f.error)),
                },
            };
        }

        let mut ys = Vec::new();
        let steps = self.multistep.first().map_or(0, |m| m.settings.len());
        for step in 0..steps {
            let pairs: Vec<(Arc<dyn Movable>, f64)> = self
                .multistep
                .iter()
                .map(|m| (Arc::clone(&m.device), m.settings[step]))
                .collect();
            match self.moves.move_devices(&pairs).await {
                Ok(outcome) if outcome.proceed => {}
                Ok(_) => {
                    warn!(step, "Multistep setting not reached, keeping what was counted");
                    return Acquired { ys, failure: None };
                }
                Err(e) => {
                    return Acquired {
                        ys,
                        failure: Some(AcquireFailure::Fatal(e)),
                    }
                }
            }
            match self
                .acquisition
                .measure(&self.detectors, preset, &self.control)
                .await
            {
                Ok(readings) => ys.extend(readings),
                Err(f) => {
                    ys.extend(f.partial);
                    return Acquired {
                        ys,
                        failure: Some(AcquireFailure::Count(f.error)),
                    };
                }
            }
        }
        Acquired { ys, failure: None }
    }

    /// Sample the environment for an acquisition window.
    pub(crate) async fn read_environment(
        &self,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> ScanResult<Vec<Option<f64>>> {
        let window = SampleWindow {
            started,
            finished,
            elapsed: (finished - self.run_started).num_milliseconds() as f64 / 1000.0,
        };
        let mut values = read_environment(
            &self.environment,
            self.context.config.environment.sampling,
            window,
            self.moves.errors(),
        )
        .await?;
        self.hooks
            .adjust_environment(&self.environment, &mut values, &window);
        Ok(values)
    }

    /// Count, sample the environment and record the point.
    ///
    /// The point is recorded if anything was counted, if there are no
    /// detector columns, or if `always_record` is set; missing readings are
    /// zero-padded. A failed count is returned for the caller to classify.
    pub(crate) async fn measure_and_record(
        &mut self,
        number: usize,
        mut xs: Vec<Option<f64>>,
        preset: &Preset,
        always_record: bool,
    ) -> ScanResult<(Option<PointRecord>, Option<AcquireFailure>)> {
        let started = Utc::now();
        let Acquired { mut ys, failure } = self.acquire(preset).await;
        let finished = Utc::now();

        match self.read_environment(started, finished).await {
            Ok(env) => xs.extend(env),
            Err(e) => {
                return Err(match failure {
                    Some(AcquireFailure::Count(first) | AcquireFailure::Fatal(first)) => first,
                    None => e,
                })
            }
        }

        let width = self.dataset.y_info.len();
        let record = if always_record || !ys.is_empty() || width == 0 {
            if ys.len() < width {
                ys.resize(width, 0.0);
            }
            Some(self.record_point(number, xs, ys, started, finished).await?)
        } else {
            None
        };
        Ok((record, failure))
    }

    /// Route a failed count through the failure policy.
    pub(crate) async fn handle_acquire_failure(&self, failure: AcquireFailure) -> ScanResult<()> {
        match failure {
            AcquireFailure::Count(ScanError::Device { source, .. }) => {
                self.moves
                    .errors()
                    .handle(Operation::Count, None, source)
                    .await?;
                Ok(())
            }
            AcquireFailure::Count(e) | AcquireFailure::Fatal(e) => Err(e),
        }
    }

    pub(crate) async fn record_point(
        &mut self,
        number: usize,
        xs: Vec<Option<f64>>,
        ys: Vec<f64>,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> ScanResult<PointRecord> {
        self.set_phase(ScanPhase::RecordPoint);
        let record = PointRecord {
            number,
            xs,
            ys,
            started,
            finished,
        };
        self.dataset.push_point(record.clone());
        for sink in &self.context.sinks {
            sink.add_point(&self.dataset, &record.xs, &record.ys).await?;
        }
        debug!(number, xs = ?record.xs, ys = ?record.ys, "Point recorded");
        Ok(record)
    }

    pub(crate) async fn add_break(&self) -> ScanResult<()> {
        for sink in &self.context.sinks {
            sink.add_break(&self.dataset).await?;
        }
        Ok(())
    }

    pub(crate) async fn before_prepare_point(&self, number: usize) -> ScanResult<PointFlow> {
        self.hooks
            .before_prepare_point(&self.hook_ctx(), number)
            .await
    }

    /// Point checkpoint, then the variant's end-of-point hook.
    pub(crate) async fn finish_point(&self, number: usize) -> ScanResult<PointFlow> {
        self.set_phase(ScanPhase::FinishPoint);
        self.control.breakpoint(Checkpoint::Point).await?;
        self.hooks.after_finish_point(&self.hook_ctx(), number).await
    }

    /// Close the dataset and notify every sink, even if one fails.
    pub(crate) async fn end_scan(&mut self) -> ScanResult<()> {
        self.set_phase(ScanPhase::EndScan);
        let mut result = self.hooks.before_end_scan(&self.hook_ctx()).await;
        self.dataset.close();
        for sink in &self.context.sinks {
            if let Err(e) = sink.end_dataset(&self.dataset).await {
                warn!(sink = %sink.name(), "Could not end dataset: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!(
            number = self.dataset.number,
            points = self.dataset.points.len(),
            "Scan finished"
        );
        result
    }

    /// EndScan after a failed BeginScan. The begin error is the one
    /// reported; a failing end is only logged.
    pub(crate) async fn end_after_failed_begin(&mut self, error: ScanError) -> ScanError {
        if let Err(e) = self.end_scan().await {
            warn!("Ending the scan after a failed start also failed: {}", e);
        }
        error
    }

    pub(crate) fn into_dataset(self) -> Dataset {
        self.set_phase(ScanPhase::Idle);
        self.dataset
    }
}

// Non-hidden devices by lowercase name, grouped by category.
async fn collect_metadata(
    devices: &[Arc<dyn Readable>],
) -> BTreeMap<InfoCategory, Vec<InfoEntry>> {
    let mut sorted: Vec<&Arc<dyn Readable>> = devices.iter().filter(|d| !d.lowlevel()).collect();
    sorted.sort_by_key(|d| d.name().to_lowercase());

    let mut by_category: BTreeMap<InfoCategory, Vec<InfoEntry>> = BTreeMap::new();
    for dev in sorted {
        match dev.info().await {
            Ok(entries) => {
                for entry in entries {
                    by_category.entry(entry.category).or_default().push(entry);
                }
            }
            Err(e) => warn!(device = %dev.name(), "Could not collect device info: {}", e),
        }
    }
    by_category
}

/// Runs one [`ScanPlan`] through the state machine.
///
/// # Example
///
/// ```rust,ignore
/// let mut controller = ScanController::new(plan);
/// let control = controller.control();
/// // control.request_stop(StopLevel::AfterPoint) from elsewhere
/// controller.run().await?;
/// let dataset = controller.dataset().unwrap();
/// ```
pub struct ScanController {
    plan: Option<ScanPlan>,
    acquisition: Arc<dyn Acquisition>,
    policy: Arc<dyn FailurePolicy>,
    control: ScanControl,
    phase: watch::Sender<ScanPhase>,
    dataset: Option<Dataset>,
}

impl ScanController {
    /// Controller counting with [`CountLoop`] under the default failure policy.
    pub fn new(plan: ScanPlan) -> Self {
        let acquisition = Arc::new(CountLoop::new(plan.context.config.count_loop_delay));
        let (phase, _) = watch::channel(ScanPhase::Idle);
        Self {
            plan: Some(plan),
            acquisition,
            policy: Arc::new(DefaultFailurePolicy),
            control: ScanControl::new(),
            phase,
            dataset: None,
        }
    }

    /// Count with a different acquisition strategy.
    pub fn with_acquisition(mut self, acquisition: Arc<dyn Acquisition>) -> Self {
        self.acquisition = acquisition;
        self
    }

    /// Classify failures with a different policy.
    pub fn with_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Stop/pause handle; clone it before `run()`.
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> ScanPhase {
        *self.phase.borrow()
    }

    /// Follow phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<ScanPhase> {
        self.phase.subscribe()
    }

    /// The dataset of the finished run, if it got as far as BeginScan.
    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref().filter(|d| d.number > 0)
    }

    /// Run the scan. A controller runs once; later calls fail with
    /// [`ScanError::AlreadyRun`].
    pub async fn run(&mut self) -> ScanResult<()> {
        let plan = self.plan.take().ok_or(ScanError::AlreadyRun)?;
        let span = info_span!("scan", kind = %plan.kind, description = %plan.description);
        let (mut run, mut source) = ScanRun::new(
            plan,
            Arc::clone(&self.acquisition),
            Arc::clone(&self.policy),
            self.control.clone(),
            self.phase.clone(),
        );

        let result = execute(&mut run, source.as_mut()).instrument(span).await;
        if let Err(e) = &result {
            if e.is_cancellation() {
                info!("Scan stopped: {}", e);
            } else {
                warn!("Scan failed: {}", e);
            }
        }
        self.dataset = Some(run.into_dataset());
        result
    }
}

async fn execute(run: &mut ScanRun, source: &mut dyn PositionSource) -> ScanResult<()> {
    let applied = run.apply_overrides().await;
    let result = match applied {
        Ok(()) => steps(run, source).await,
        Err(e) => Err(e),
    };
    let restored = run.restore_overrides().await;
    result.and(restored)
}

fn position_of(step: SourceStep) -> ScanResult<Option<Vec<f64>>> {
    match step {
        SourceStep::Position(position) => Ok(Some(position)),
        SourceStep::Exhausted => Ok(None),
        SourceStep::Terminated(reason) => Err(ScanError::Terminated(reason)),
    }
}

async fn steps(run: &mut ScanRun, source: &mut dyn PositionSource) -> ScanResult<()> {
    let first = position_of(source.next_position(&run.control).await?)?;
    let (can_measure, wait_values) = run.prepare_scan(first.as_deref()).await?;
    if !can_measure {
        warn!("Start position not reached, the first point will be skipped");
    }

    if let Err(e) = run.begin_scan().await {
        // sinks may have seen the header; they get the end too
        return Err(run.end_after_failed_begin(e).await);
    }

    let body = points(run, source, first, can_measure, wait_values).await;
    let ended = run.end_scan().await;
    body.and(ended)?;
    run.control.breakpoint(Checkpoint::Run).await
}

async fn points(
    run: &mut ScanRun,
    source: &mut dyn PositionSource,
    first: Option<Vec<f64>>,
    can_measure: bool,
    wait_values: BTreeMap<String, Vec<f64>>,
) -> ScanResult<()> {
    let mut next = first;
    let mut wait_values = Some(wait_values);
    let mut index = 0usize;

    while let Some(position) = next.take() {
        if source.take_break() && index > 0 {
            run.add_break().await?;
        }
        let number = index + 1;
        let span = match run.npoints {
            0 => info_span!("point", number),
            total => info_span!("point", number, total),
        };
        let flow = point(
            run,
            source,
            index,
            &position,
            can_measure,
            wait_values.take().unwrap_or_default(),
        )
        .instrument(span)
        .await?;
        if flow == PointFlow::StopScan {
            info!(points = number, "Scan ended early");
            break;
        }
        index += 1;
        next = position_of(source.next_position(&run.control).await?)?;
    }
    Ok(())
}

async fn point(
    run: &mut ScanRun,
    source: &mut dyn PositionSource,
    index: usize,
    position: &[f64],
    can_measure: bool,
    wait_values: BTreeMap<String, Vec<f64>>,
) -> ScanResult<PointFlow> {
    let number = index + 1;
    if run.before_prepare_point(number).await? == PointFlow::StopScan {
        return Ok(PointFlow::StopScan);
    }

    let measured = measure_point(run, source, index, position, can_measure, wait_values).await;
    let record = measured.as_ref().ok().and_then(Option::as_ref);
    let reported = source.on_point_finished(record).await;
    let finished = run.finish_point(number).await;

    measured?;
    reported?;
    finished
}

async fn measure_point(
    run: &mut ScanRun,
    source: &mut dyn PositionSource,
    index: usize,
    position: &[f64],
    can_measure: bool,
    wait_values: BTreeMap<String, Vec<f64>>,
) -> ScanResult<Option<PointRecord>> {
    let number = index + 1;
    if !run.prepare_point(number).await? {
        return Ok(None);
    }
    source.on_point_started(position).await?;

    // the first point was approached in PrepareScan
    if index == 0 && !can_measure {
        return Ok(None);
    }
    let values = if index == 0 || position.is_empty() {
        wait_values
    } else {
        run.set_phase(ScanPhase::Move);
        let outcome = run.moves.move_devices(&run.pairs(position)).await?;
        if !outcome.proceed {
            return Ok(None);
        }
        outcome.values
    };

    let xs = run.moves.read_positions(&run.devices, &values).await?;
    let preset = run.preset.clone();
    let (record, failure) = run.measure_and_record(number, xs, &preset, false).await?;
    if let Some(failure) = failure {
        run.handle_acquire_failure(failure).await?;
    }
    Ok(record)
}

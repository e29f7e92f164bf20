//! Manual scans: the caller decides when each point is taken.
//!
//! Only one manual scan may be open per [`ScanContext`]; the slot is taken
//! when the scan is built and released when it is ended or dropped.
//!
//! ```rust,ignore
//! let mut scan = builders::manual_scan()
//!     .preset(Preset::new().with("t", 1.0))
//!     .build(&ctx)?;
//! scan.begin().await?;
//! for setting in [1.0, 2.0, 3.0] {
//!     magnet.start(setting).await?;
//!     scan.step(None).await?;
//! }
//! let dataset = scan.end().await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scan_core::{Dataset, Measurable, Movable, Preset, ScanError, ScanResult};
use tokio::sync::watch;
use tracing::{debug, info_span, Instrument};

use crate::acquisition::{Acquisition, CountLoop};
use crate::control::ScanControl;
use crate::controller::{ScanPhase, ScanRun};
use crate::motion::{DefaultFailurePolicy, FailurePolicy};
use crate::plan::{EnvironmentSelection, ScanContext, ScanKind, ScanPlanBuilder, SpeedOverride};
use crate::positions::RepeatSource;

/// Guards against two manual scans being open at once.
#[derive(Debug, Clone, Default)]
pub struct ManualScanSlot {
    taken: Arc<AtomicBool>,
}

impl ManualScanSlot {
    /// Take the slot, failing with [`ScanError::ManualScanActive`] if it is held.
    pub fn try_acquire(&self) -> ScanResult<ManualScanToken> {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ScanError::ManualScanActive)?;
        Ok(ManualScanToken {
            taken: Arc::clone(&self.taken),
        })
    }

    /// Whether a manual scan currently holds the slot.
    pub fn is_active(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

/// Held while a manual scan is open.
#[derive(Debug)]
pub struct ManualScanToken {
    taken: Arc<AtomicBool>,
}

impl Drop for ManualScanToken {
    fn drop(&mut self) {
        self.taken.store(false, Ordering::Release);
    }
}

/// Builder for [`ManualScan`].
pub struct ManualScanBuilder {
    plan: ScanPlanBuilder,
    acquisition: Option<Arc<dyn Acquisition>>,
    policy: Arc<dyn FailurePolicy>,
}

impl Default for ManualScanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScanBuilder {
    /// Builder with no detectors or environment overrides.
    pub fn new() -> Self {
        let source = RepeatSource::infinite();
        Self {
            plan: ScanPlanBuilder::new(ScanKind::Manual, Vec::new(), Box::new(source)),
            acquisition: None,
            policy: Arc::new(DefaultFailurePolicy),
        }
    }

    /// Free-text description stored in the dataset.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plan = self.plan.description(description);
        self
    }

    /// Default preset of `step(None)`.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.plan = self.plan.preset(preset);
        self
    }

    /// Detectors to use instead of the context's defaults.
    pub fn detectors(mut self, detectors: Vec<Arc<dyn Measurable>>) -> Self {
        self.plan = self.plan.detectors(detectors);
        self
    }

    /// Environment channels to sample.
    pub fn environment(mut self, selection: EnvironmentSelection) -> Self {
        self.plan = self.plan.environment(selection);
        self
    }

    /// Count once per setting of `device` at every step.
    pub fn multistep(mut self, device: Arc<dyn Movable>, settings: Vec<f64>) -> Self {
        self.plan = self.plan.multistep(device, settings);
        self
    }

    /// Override a speed or acceleration while the scan is open.
    pub fn speed_override(mut self, over: SpeedOverride) -> Self {
        self.plan = self.plan.speed_override(over);
        self
    }

    /// Free-form entry handed to the sinks.
    pub fn sink_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.plan = self.plan.sink_info(key, value);
        self
    }

    /// Count with a different acquisition strategy.
    pub fn acquisition(mut self, acquisition: Arc<dyn Acquisition>) -> Self {
        self.acquisition = Some(acquisition);
        self
    }

    /// Failure policy of the steps.
    pub fn policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the plan and take the context's manual scan slot.
    pub fn build(self, ctx: &ScanContext) -> ScanResult<ManualScan> {
        let plan = self.plan.build(ctx)?;
        let token = ctx.manual_slot().try_acquire()?;
        let acquisition = self
            .acquisition
            .unwrap_or_else(|| Arc::new(CountLoop::new(ctx.config.count_loop_delay)));
        let (phase, _) = watch::channel(ScanPhase::Idle);
        let (run, _source) = ScanRun::new(plan, acquisition, self.policy, ScanControl::new(), phase);
        Ok(ManualScan {
            run,
            _token: token,
            begun: false,
            taken: 0,
        })
    }
}

/// An open manual scan.
///
/// Call [`begin`](Self::begin) once, [`step`](Self::step) per point and
/// [`end`](Self::end) when done; `end` must also be called after a failed
/// step so the sinks see the dataset closed.
pub struct ManualScan {
    run: ScanRun,
    _token: ManualScanToken,
    begun: bool,
    taken: usize,
}

impl ManualScan {
    /// Stop/pause handle of this scan.
    pub fn control(&self) -> ScanControl {
        self.run.control.clone()
    }

    /// Points recorded so far.
    pub fn dataset(&self) -> &Dataset {
        &self.run.dataset
    }

    /// Apply speed overrides and open the dataset. No devices are moved.
    pub async fn begin(&mut self) -> ScanResult<()> {
        if self.begun {
            return Err(ScanError::Config("manual scan already begun".to_string()));
        }
        self.run.apply_overrides().await?;
        self.begun = true;
        if let Err(e) = self.run.begin_scan().await {
            return Err(self.run.end_after_failed_begin(e).await);
        }
        Ok(())
    }

    /// Count once (once per multistep setting) and record the point.
    ///
    /// `preset` replaces the scan's default preset for this point. The point
    /// is always recorded, zero-padded if the count failed in a way the
    /// failure policy tolerates. Returns the detector readings.
    pub async fn step(&mut self, preset: Option<Preset>) -> ScanResult<Vec<f64>> {
        if !self.begun {
            return Err(ScanError::Config(
                "manual scan step before begin".to_string(),
            ));
        }
        self.taken += 1;
        let number = self.taken;
        let preset = preset.unwrap_or_else(|| self.run.preset.clone());
        let run = &mut self.run;

        async move {
            let measured = if run.prepare_point(number).await? {
                let (record, failure) = run
                    .measure_and_record(number, Vec::new(), &preset, true)
                    .await?;
                if let Some(failure) = failure {
                    run.handle_acquire_failure(failure).await?;
                }
                record.map(|r| r.ys).unwrap_or_default()
            } else {
                Vec::new()
            };
            run.finish_point(number).await?;
            debug!(number, "Manual step done");
            Ok::<_, ScanError>(measured)
        }
        .instrument(info_span!("point", number))
        .await
    }

    /// Close the dataset and release the manual scan slot.
    pub async fn end(mut self) -> ScanResult<Dataset> {
        let ended = if self.begun {
            self.run.end_scan().await
        } else {
            Ok(())
        };
        let restored = self.run.restore_overrides().await;
        ended.and(restored)?;
        Ok(self.run.into_dataset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sink::MemorySink;
    use scan_mock::{MockDetector, MockMotor};

    fn ctx(sink: Arc<MemorySink>) -> ScanContext {
        ScanContext::new(EngineConfig::default())
            .with_detectors(vec![Arc::new(MockDetector::new("ctr"))])
            .with_sink(sink)
    }

    #[tokio::test]
    async fn only_one_manual_scan_at_a_time() {
        let ctx = ctx(Arc::new(MemorySink::new("mem")));
        let first = ManualScanBuilder::new().build(&ctx).unwrap();
        assert!(ctx.manual_slot().is_active());
        assert!(matches!(
            ManualScanBuilder::new().build(&ctx),
            Err(ScanError::ManualScanActive)
        ));

        first.end().await.unwrap();
        assert!(!ctx.manual_slot().is_active());
        assert!(ManualScanBuilder::new().build(&ctx).is_ok());
    }

    #[tokio::test]
    async fn steps_record_points_with_their_preset() {
        let sink = Arc::new(MemorySink::new("mem"));
        let ctx = ctx(Arc::clone(&sink));
        let mut scan = ManualScanBuilder::new()
            .preset(Preset::new().with("t", 1.0))
            .build(&ctx)
            .unwrap();

        scan.begin().await.unwrap();
        assert_eq!(scan.step(None).await.unwrap(), vec![1.0, 100.0]);
        assert_eq!(
            scan.step(Some(Preset::new().with("t", 2.0))).await.unwrap(),
            vec![2.0, 200.0]
        );
        let dataset = scan.end().await.unwrap();

        assert_eq!(dataset.kind, "manual");
        assert_eq!(dataset.points.len(), 2);
        assert_eq!(dataset.points[1].number, 2);
        assert!(dataset.is_closed());
        assert_eq!(sink.end_count().await, 1);
    }

    #[tokio::test]
    async fn multistep_columns_are_named_per_setting() {
        let ctx = ctx(Arc::new(MemorySink::new("mem")));
        let manual = MockMotor::new("manual");
        let mut scan = ManualScanBuilder::new()
            .multistep(Arc::new(manual.clone()), vec![3.0, 4.0])
            .build(&ctx)
            .unwrap();

        scan.begin().await.unwrap();
        let ys = scan.step(None).await.unwrap();
        let dataset = scan.end().await.unwrap();

        assert_eq!(
            dataset.y_names(),
            vec!["ctr_time_manual_3", "ctr_manual_3", "ctr_time_manual_4", "ctr_manual_4"]
        );
        assert_eq!(ys.len(), 4);
        assert_eq!(manual.started_targets().await, vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn step_requires_begin() {
        let ctx = ctx(Arc::new(MemorySink::new("mem")));
        let mut scan = ManualScanBuilder::new().build(&ctx).unwrap();
        assert!(matches!(scan.step(None).await, Err(ScanError::Config(_))));
    }
}

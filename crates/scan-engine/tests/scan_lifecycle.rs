//! End-to-end scan runs against mock devices.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scan_core::{
    DeviceErrorKind, DeviceResult, DeviceStatus, InfoCategory, Measurable, Movable, Preset,
    Readable, ScanError, ScanResult, StopLevel, ValueInfo,
};
use scan_engine::{
    builders, ChannelDecisionService, Decision, DecisionRequest, EngineConfig, EnvChannel,
    EnvironmentSampling, HookContext, ListSource, MemorySink, PointFlow, ScanContext, ScanController, ScanHooks,
    ScanKind, ScanPhase, SinkEvent, SpeedOverride,
};
use scan_mock::{
    ErrorConfig, ErrorScenario, MockDetector, MockMode, MockMotor, MockSensor, MotorLimits,
};
use tracing_test::traced_test;

fn context(sink: &Arc<MemorySink>, det: &MockDetector) -> ScanContext {
    ScanContext::new(EngineConfig::default())
        .with_detectors(vec![Arc::new(det.clone()) as Arc<dyn Measurable>])
        .with_sink(Arc::clone(sink) as Arc<dyn scan_engine::DataSink>)
}

fn failing_motor(name: &str, target: f64, kind: DeviceErrorKind) -> MockMotor {
    MockMotor::builder(name)
        .errors(ErrorConfig::scenario(ErrorScenario::OnTarget {
            operation: "start",
            target,
            kind,
        }))
        .build()
}

fn positions(lists: Vec<f64>) -> Vec<Vec<f64>> {
    vec![lists]
}

/// Records every point that reached FinishPoint.
#[derive(Default)]
struct FinishedPoints(Mutex<Vec<usize>>);

impl FinishedPoints {
    fn numbers(&self) -> Vec<usize> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanHooks for FinishedPoints {
    async fn after_finish_point(
        &self,
        _ctx: &HookContext<'_>,
        number: usize,
    ) -> ScanResult<PointFlow> {
        self.0.lock().unwrap().push(number);
        Ok(PointFlow::Continue)
    }
}

#[tokio::test]
async fn range_scan_records_every_point_in_order() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let motor = MockMotor::new("m");
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(motor.clone())], &[0.0], &[1.0], 11)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    let xs: Vec<f64> = dataset.x_column(0).into_iter().flatten().collect();
    assert_eq!(xs, (0..11).map(f64::from).collect::<Vec<_>>());
    assert_eq!(dataset.npoints, 11);
    assert_eq!(dataset.number, 1);
    assert_eq!(dataset.y_names(), vec!["ctr_time", "ctr"]);
    assert!(dataset.points.iter().all(|p| p.ys == vec![1.0, 100.0]));
    let numbers: Vec<usize> = dataset.points.iter().map(|p| p.number).collect();
    assert_eq!(numbers, (1..=11).collect::<Vec<_>>());

    let events = sink.events().await;
    assert!(matches!(events.first(), Some(SinkEvent::Prepare { .. })));
    assert!(matches!(events.get(1), Some(SinkEvent::Begin { .. })));
    assert!(matches!(events.last(), Some(SinkEvent::End { points: 11, .. })));
    assert_eq!(sink.end_count().await, 1);
    assert_eq!(controller.phase(), ScanPhase::Idle);
}

#[tokio::test]
async fn range_to_end_rounds_the_point_count() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::range_scan_to(Arc::new(MockMotor::new("m")), 30.0, 0.1, 30.19)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let xs: Vec<f64> = controller.dataset().unwrap().x_column(0).into_iter().flatten().collect();
    assert_eq!(xs.len(), 3);
    for (got, want) in xs.iter().zip([30.0, 30.1, 30.2]) {
        assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
    }
}

#[tokio::test]
async fn centered_scan_spans_both_sides() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::centered_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 5)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let xs: Vec<f64> = controller.dataset().unwrap().x_column(0).into_iter().flatten().collect();
    assert_eq!(xs, (-5..=5).map(f64::from).collect::<Vec<_>>());
}

#[tokio::test]
#[traced_test]
async fn skipped_point_is_not_measured_but_finishes() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);
    let hooks = Arc::new(FinishedPoints::default());

    let motor = failing_motor("m", 3.0, DeviceErrorKind::Limit);
    let plan = builders::list_scan(vec![Arc::new(motor)], positions(vec![1.0, 2.0, 3.0, 4.0, 5.0]))
        .unwrap()
        .hooks(Arc::clone(&hooks) as Arc<dyn ScanHooks>)
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    let numbers: Vec<usize> = dataset.points.iter().map(|p| p.number).collect();
    assert_eq!(numbers, vec![1, 2, 4, 5]);
    assert_eq!(det.start_calls().await, 4);
    assert_eq!(hooks.numbers(), vec![1, 2, 3, 4, 5]);
    assert!(logs_contain("Skipping point"));
}

#[tokio::test]
async fn measure_anyway_failure_records_the_point() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let motor = failing_motor("m", 3.0, DeviceErrorKind::Move);
    let plan = builders::list_scan(vec![Arc::new(motor)], positions(vec![1.0, 2.0, 3.0, 4.0]))
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.points.len(), 4);
    // the motor never left 2.0
    assert_eq!(dataset.points[2].xs[0], Some(2.0));
}

#[tokio::test]
async fn fatal_failure_still_ends_the_dataset_once() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let motor = failing_motor("m", 3.0, DeviceErrorKind::Fixed);
    let plan = builders::list_scan(
        vec![Arc::new(motor.clone())],
        positions(vec![1.0, 2.0, 3.0, 4.0]),
    )
    .unwrap()
    .speed_override(SpeedOverride {
        device: Arc::new(motor.clone()),
        speed: Some(2.0),
        accel: None,
    })
    .build(&ctx)
    .unwrap();
    let mut controller = ScanController::new(plan);

    let err = controller.run().await.unwrap_err();
    assert!(matches!(
        err,
        ScanError::Device {
            target: Some(t),
            ..
        } if t == 3.0
    ));
    assert_eq!(err.device_error().map(|e| e.kind), Some(DeviceErrorKind::Fixed));

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.points.len(), 2);
    assert!(dataset.is_closed());
    assert_eq!(sink.end_count().await, 1);
    assert_eq!(motor.speed_log().await, vec![2.0, 10.0]);
}

#[tokio::test]
async fn fatal_failure_at_the_start_never_begins() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let motor = failing_motor("m", 1.0, DeviceErrorKind::Disabled);
    let plan = builders::list_scan(vec![Arc::new(motor)], positions(vec![1.0, 2.0]))
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);

    assert!(controller.run().await.is_err());
    assert!(controller.dataset().is_none());
    assert!(sink.events().await.is_empty());
    assert_eq!(ctx.scan_count(), 0);
}

#[tokio::test]
async fn unreachable_start_skips_only_the_first_point() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let motor = failing_motor("m", 1.0, DeviceErrorKind::Communication);
    let plan = builders::list_scan(vec![Arc::new(motor)], positions(vec![1.0, 2.0, 3.0]))
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let numbers: Vec<usize> = controller
        .dataset()
        .unwrap()
        .points
        .iter()
        .map(|p| p.number)
        .collect();
    assert_eq!(numbers, vec![2, 3]);
}

#[tokio::test]
async fn prepare_failure_skips_the_point() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr").errors(ErrorConfig::scenario(ErrorScenario::OnCall {
        operation: "prepare",
        call: 2,
        kind: DeviceErrorKind::Timeout,
    }));
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 3)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let numbers: Vec<usize> = controller
        .dataset()
        .unwrap()
        .points
        .iter()
        .map(|p| p.number)
        .collect();
    assert_eq!(numbers, vec![1, 3]);
}

#[tokio::test]
async fn multistep_doubles_the_detector_columns() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);
    let pol = MockMotor::new("pol");

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 3)
        .unwrap()
        .multistep(Arc::new(pol.clone()), vec![0.0, 1.0])
        .build(&ctx)
        .unwrap();
    assert_eq!(plan.multistep_count(), 2);
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(
        dataset.y_names(),
        vec!["ctr_time_pol_0", "ctr_pol_0", "ctr_time_pol_1", "ctr_pol_1"]
    );
    assert_eq!(dataset.points.len(), 3);
    for point in &dataset.points {
        assert_eq!(point.ys.len(), 4);
        assert_eq!(point.xs.len(), 1);
    }
    assert_eq!(pol.started_targets().await, vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    assert_eq!(det.start_calls().await, 6);
}

#[tokio::test(start_paused = true)]
async fn stop_after_point_keeps_finished_points() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr").mode(MockMode::Realistic);
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 10)
        .unwrap()
        .preset(Preset::new().with("t", 1.0))
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    let control = controller.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        control.request_stop(StopLevel::AfterPoint);
    });

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, ScanError::Cancelled(StopLevel::AfterPoint)));

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.points.len(), 2);
    assert!(dataset.points.iter().all(|p| p.ys == vec![1.0, 100.0]));
    assert_eq!(det.prepare_calls().await, 2);
    assert_eq!(sink.end_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn stop_after_scan_lets_the_scan_finish() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr").mode(MockMode::Realistic);
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 3)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.control().request_stop(StopLevel::AfterScan);

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, ScanError::Cancelled(StopLevel::AfterScan)));
    assert_eq!(controller.dataset().unwrap().points.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn immediate_stop_interrupts_the_count() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr").mode(MockMode::Realistic);
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 10)
        .unwrap()
        .preset(Preset::new().with("t", 1.0))
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    let control = controller.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        control.request_stop(StopLevel::Immediate);
    });

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, ScanError::Cancelled(StopLevel::Immediate)));
    assert!(det.stop_calls().await >= 1);

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.points[0].ys, vec![1.0, 100.0]);
    assert!(dataset.points.len() <= 2);
    assert!(dataset.is_closed());
}

#[tokio::test]
async fn second_run_is_refused() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();
    assert!(matches!(controller.run().await, Err(ScanError::AlreadyRun)));
    assert_eq!(sink.end_count().await, 1);
}

#[tokio::test]
async fn scan_numbers_increase_per_context() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    for expected in 1..=3 {
        let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
            .unwrap()
            .build(&ctx)
            .unwrap();
        let mut controller = ScanController::new(plan);
        controller.run().await.unwrap();
        assert_eq!(controller.dataset().unwrap().number, expected);
    }
    let uids: Vec<String> = sink.datasets().await.into_iter().map(|d| d.uid).collect();
    assert_eq!(uids.len(), 3);
    assert_ne!(uids[0], uids[1]);
}

#[tokio::test]
async fn metadata_skips_hidden_devices_and_sorts_by_name() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det).with_metadata_devices(vec![
        Arc::new(MockSensor::new("Temp", "K", 300.0)) as Arc<dyn Readable>,
        Arc::new(MockSensor::new("hidden", "V", 1.0).lowlevel()),
        Arc::new(
            MockMotor::builder("alpha")
                .limits(MotorLimits::hard_stop(-1.0, 1.0))
                .build(),
        ),
    ]);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    let devices: Vec<&str> = dataset
        .metadata
        .values()
        .flatten()
        .map(|e| e.device.as_str())
        .collect();
    assert!(!devices.contains(&"hidden"));
    let general: Vec<&str> = dataset.metadata[&InfoCategory::General]
        .iter()
        .map(|e| e.device.as_str())
        .collect();
    assert_eq!(general.first(), Some(&"alpha"));
    assert!(dataset.metadata.contains_key(&InfoCategory::Limits));

    let info_events = sink
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, SinkEvent::Info { .. }))
        .count();
    assert_eq!(info_events, dataset.metadata.len());
}

#[tokio::test]
async fn environment_columns_follow_the_devices() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det).with_environment(vec![EnvChannel::Device(Arc::new(
        MockSensor::new("T", "K", 295.0),
    ))]);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.x_names(), vec!["m", "T"]);
    assert_eq!(dataset.env_count, 1);
    assert_eq!(dataset.x_column(1), vec![Some(295.0), Some(295.0)]);
}

#[tokio::test]
async fn failed_environment_read_becomes_none() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let sensor = MockSensor::new("T", "K", 295.0).errors(ErrorConfig::scenario(
        ErrorScenario::OnCall {
            operation: "read",
            call: 1,
            kind: DeviceErrorKind::Communication,
        },
    ));
    let ctx = context(&sink, &det).with_environment(vec![EnvChannel::Device(Arc::new(sensor))]);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.points.len(), 2);
    assert_eq!(dataset.x_column(1), vec![None, Some(295.0)]);
}

#[tokio::test]
async fn snake_grid_breaks_between_rows() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::grid_scan(
        vec![Arc::new(MockMotor::new("y"))],
        ListSource::equidistant(&[0.0], &[1.0], 2).unwrap(),
        vec![Arc::new(MockMotor::new("x"))],
        ListSource::equidistant(&[0.0], &[1.0], 3).unwrap(),
        true,
    )
    .unwrap()
    .build(&ctx)
    .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    let inner: Vec<f64> = dataset.x_column(1).into_iter().flatten().collect();
    assert_eq!(inner, vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);

    let breaks = sink
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, SinkEvent::Break))
        .count();
    assert_eq!(breaks, 1);
}

#[tokio::test(start_paused = true)]
async fn time_scan_counts_with_delay() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::time_scan(Some(3), Preset::new().with("t", 1.0).with("delay", 5.0))
        .build(&ctx)
        .unwrap();
    assert_eq!(plan.kind(), ScanKind::Time);
    let mut controller = ScanController::new(plan);

    let started = tokio::time::Instant::now();
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.points.len(), 3);
    assert_eq!(dataset.x_names(), vec!["etime"]);
    assert!(started.elapsed() >= Duration::from_secs(10));
    for preset in det.presets().await {
        assert_eq!(preset.get("delay"), None);
    }
}

#[tokio::test(start_paused = true)]
async fn sweep_ends_when_the_device_arrives() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr").mode(MockMode::Realistic);
    let ctx = context(&sink, &det);
    let magnet = MockMotor::builder("B")
        .speed(1.0)
        .mode(MockMode::Realistic)
        .build();

    let plan = builders::sweep(
        vec![(Arc::new(magnet.clone()) as Arc<dyn Movable>, Some(0.0), 3.0)],
        None,
        Preset::new().with("t", 1.0),
    )
    .build(&ctx)
    .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.kind, "sweep");
    assert_eq!(dataset.x_names(), vec!["B"]);
    assert_eq!(dataset.points.len(), 3);
    assert_eq!(magnet.started_targets().await, vec![0.0, 3.0]);
    let field: Vec<f64> = dataset.x_column(0).into_iter().flatten().collect();
    assert!(field.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn adaptive_scan_reports_infeasible_positions() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);
    let motor = MockMotor::builder("m")
        .limits(MotorLimits::hard_stop(-5.0, 5.0))
        .build();

    let (service, mut requests) = ChannelDecisionService::channel(8);
    let decider = tokio::spawn(async move {
        let mut script = vec![
            Decision::Position(vec![1.0]),
            Decision::Position(vec![9.0]),
            Decision::Position(vec![2.0]),
            Decision::Done,
        ]
        .into_iter();
        let mut infeasible = Vec::new();
        let mut results = 0;
        while let Some(request) = requests.recv().await {
            match request {
                DecisionRequest::Next { reply, .. } => {
                    let _ = reply.send(script.next().unwrap_or(Decision::Done));
                }
                DecisionRequest::Infeasible { position, kind, .. } => infeasible.push((position, kind)),
                DecisionRequest::Result { record } => {
                    assert!(record.is_some());
                    results += 1;
                }
            }
        }
        (infeasible, results)
    });

    let plan = builders::adaptive_scan(&ctx, vec![Arc::new(motor.clone())], Box::new(service), None)
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();
    drop(controller);

    let (infeasible, results) = decider.await.unwrap();
    assert_eq!(infeasible, vec![(vec![9.0], DeviceErrorKind::Limit)]);
    assert_eq!(results, 2);
    assert_eq!(motor.started_targets().await, vec![1.0, 2.0]);
    assert_eq!(sink.datasets().await[0].npoints, 0);
}

#[tokio::test]
async fn phase_watchers_see_the_run_end_idle() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    let mut phases = controller.subscribe_phase();
    controller.run().await.unwrap();

    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), ScanPhase::Idle);
}

/// Fails at the start and at the end of the scan.
struct BrokenBookkeeping;

#[async_trait]
impl ScanHooks for BrokenBookkeeping {
    async fn after_begin_scan(
        &self,
        _ctx: &HookContext<'_>,
        _dataset: &scan_core::Dataset,
    ) -> ScanResult<()> {
        Err(ScanError::Config("no logbook".to_string()))
    }

    async fn before_end_scan(&self, _ctx: &HookContext<'_>) -> ScanResult<()> {
        Err(ScanError::Config("logbook still missing".to_string()))
    }
}

#[tokio::test]
#[traced_test]
async fn failed_start_reports_its_error_and_logs_the_failed_end() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let ctx = context(&sink, &det);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 3)
        .unwrap()
        .hooks(Arc::new(BrokenBookkeeping))
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    let err = controller.run().await.unwrap_err();

    assert!(err.to_string().contains("no logbook"));
    assert!(controller.dataset().unwrap().points.is_empty());
    assert_eq!(sink.end_count().await, 1);
    assert!(logs_contain("also failed"));
    assert!(logs_contain("logbook still missing"));
}

/// Environment device with two values and no history.
struct Pair;

#[async_trait]
impl Readable for Pair {
    fn name(&self) -> &str {
        "pair"
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new("pair_a", "V"), ValueInfo::new("pair_b", "V")]
    }

    async fn read(&self) -> DeviceResult<Vec<f64>> {
        Ok(vec![1.0, 2.0])
    }

    async fn status(&self) -> DeviceResult<DeviceStatus> {
        Ok(DeviceStatus::Ok)
    }
}

#[tokio::test]
async fn statistics_sampling_keeps_columns_aligned() {
    let sink = Arc::new(MemorySink::new("mem"));
    let det = MockDetector::new("ctr");
    let mut config = EngineConfig::default();
    config.environment.sampling = EnvironmentSampling::Statistics;
    let ctx = ScanContext::new(config)
        .with_detectors(vec![Arc::new(det.clone()) as Arc<dyn Measurable>])
        .with_environment(vec![
            EnvChannel::Device(Arc::new(Pair)),
            EnvChannel::Device(Arc::new(MockSensor::new("T", "K", 4.0))),
        ])
        .with_sink(Arc::clone(&sink) as Arc<dyn scan_engine::DataSink>);

    let plan = builders::range_scan(vec![Arc::new(MockMotor::new("m"))], &[0.0], &[1.0], 2)
        .unwrap()
        .build(&ctx)
        .unwrap();
    let mut controller = ScanController::new(plan);
    controller.run().await.unwrap();

    let dataset = controller.dataset().unwrap();
    assert_eq!(dataset.x_names(), vec!["m", "pair_a", "pair_b", "T"]);
    for point in &dataset.points {
        assert_eq!(point.xs.len(), dataset.x_names().len());
        assert_eq!(&point.xs[1..], &[Some(1.0), Some(2.0), Some(4.0)]);
    }
}

//! Move coordination and failure policy.
//!
//! Moves are two-phase: every device of a batch is started first, then every
//! started device is waited on, in order. Real hardware therefore moves
//! concurrently while errors are still attributed to the device that raised
//! them, in a stable order.
//!
//! Every device failure goes through [`ErrorHandler::handle`], which asks the
//! [`FailurePolicy`] what to do:
//!
//! - `Skip`: the point is abandoned, the run continues
//! - `Continue`: the point is measured anyway
//! - `Abort`: the error propagates with device and target context

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use scan_core::{DeviceError, DeviceErrorKind, Measurable, Movable, Operation, ScanError, ScanResult};
use tracing::{debug, error, instrument, warn};

/// What to do about a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Abandon the current point
    Skip,
    /// Ignore the failure and measure anyway
    Continue,
    /// Abort the run
    Abort,
}

/// Classifies device failures.
pub trait FailurePolicy: Send + Sync {
    /// Decide how to react to `error` raised during `op`.
    fn classify(&self, op: Operation, error: &DeviceError) -> FailureAction;

    /// Stop every moving device and detector before an abort propagates.
    fn stop_hardware_on_abort(&self) -> bool {
        false
    }
}

/// Default classification by error kind.
///
/// | kind                                             | action   |
/// |--------------------------------------------------|----------|
/// | Limit, InvalidValue, Communication, Computation  | Skip     |
/// | Position, Move, Timeout                          | Continue |
/// | anything else                                    | Abort    |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFailurePolicy;

impl FailurePolicy for DefaultFailurePolicy {
    fn classify(&self, _op: Operation, error: &DeviceError) -> FailureAction {
        match error.kind {
            DeviceErrorKind::Limit
            | DeviceErrorKind::InvalidValue
            | DeviceErrorKind::Communication
            | DeviceErrorKind::Computation => FailureAction::Skip,
            DeviceErrorKind::Position | DeviceErrorKind::Move | DeviceErrorKind::Timeout => {
                FailureAction::Continue
            }
            DeviceErrorKind::Fixed
            | DeviceErrorKind::Disabled
            | DeviceErrorKind::Unsupported
            | DeviceErrorKind::Other => FailureAction::Abort,
        }
    }
}

/// Wraps a policy and stops all hardware before an abort propagates.
///
/// Move and count may overlap in some scans, so a fatal error leaves other
/// devices running unless they are stopped explicitly.
#[derive(Debug, Clone, Default)]
pub struct StrictFailurePolicy<P = DefaultFailurePolicy> {
    inner: P,
}

impl<P: FailurePolicy> StrictFailurePolicy<P> {
    /// Wrap `inner`.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: FailurePolicy> FailurePolicy for StrictFailurePolicy<P> {
    fn classify(&self, op: Operation, error: &DeviceError) -> FailureAction {
        self.inner.classify(op, error)
    }

    fn stop_hardware_on_abort(&self) -> bool {
        true
    }
}

/// Applies a failure policy for one run.
pub struct ErrorHandler {
    policy: Arc<dyn FailurePolicy>,
    movables: Vec<Arc<dyn Movable>>,
    detectors: Vec<Arc<dyn Measurable>>,
}

impl ErrorHandler {
    /// Handler stopping `movables` and `detectors` if the policy asks for it.
    pub fn new(
        policy: Arc<dyn FailurePolicy>,
        movables: Vec<Arc<dyn Movable>>,
        detectors: Vec<Arc<dyn Measurable>>,
    ) -> Self {
        Self {
            policy,
            movables,
            detectors,
        }
    }

    /// Classify a failure and act on it.
    ///
    /// Read failures never skip a point (the value becomes `None`), and
    /// prepare failures never measure anyway.
    pub async fn handle(
        &self,
        op: Operation,
        target: Option<f64>,
        error: DeviceError,
    ) -> ScanResult<FailureAction> {
        let action = match (op, self.policy.classify(op, &error)) {
            (Operation::Read, FailureAction::Skip) => FailureAction::Continue,
            (Operation::Prepare, FailureAction::Continue) => FailureAction::Skip,
            (_, action) => action,
        };

        match action {
            FailureAction::Skip => {
                warn!(op = %op, device = %error.device, target = ?target, "Skipping point: {}", error);
            }
            FailureAction::Continue => {
                warn!(op = %op, device = %error.device, target = ?target, "Continuing despite: {}", error);
            }
            FailureAction::Abort => {
                error!(op = %op, device = %error.device, target = ?target, "Aborting scan: {}", error);
                if self.policy.stop_hardware_on_abort() {
                    self.stop_all().await;
                }
                return Err(ScanError::device(op, target, error));
            }
        }
        Ok(action)
    }

    /// Stop every device and detector, logging failures.
    pub async fn stop_all(&self) {
        let movables = join_all(self.movables.iter().map(|dev| dev.stop())).await;
        for (dev, result) in self.movables.iter().zip(movables) {
            if let Err(e) = result {
                warn!(device = %dev.name(), "Could not stop device: {}", e);
            }
        }
        let detectors = join_all(self.detectors.iter().map(|det| det.stop())).await;
        for (det, result) in self.detectors.iter().zip(detectors) {
            if let Err(e) = result {
                warn!(device = %det.name(), "Could not stop detector: {}", e);
            }
        }
    }
}

/// Result of a batch move.
#[derive(Debug, Clone, Default)]
pub struct MoveOutcome {
    /// Whether the point may be measured
    pub proceed: bool,
    /// Values returned by `wait()`, by device name
    pub values: BTreeMap<String, Vec<f64>>,
}

/// Starts and waits on batches of device moves.
pub struct MoveCoordinator {
    errors: Arc<ErrorHandler>,
}

impl MoveCoordinator {
    /// Coordinator routing failures through `errors`.
    pub fn new(errors: Arc<ErrorHandler>) -> Self {
        Self { errors }
    }

    /// The error handler in use.
    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// Start every device, then wait for every device that started.
    #[instrument(skip_all, fields(devices = pairs.len()))]
    pub async fn move_devices(&self, pairs: &[(Arc<dyn Movable>, f64)]) -> ScanResult<MoveOutcome> {
        let (started, mut proceed) = self.start_all(pairs).await?;

        let mut values = BTreeMap::new();
        for (dev, target) in started {
            match dev.wait().await {
                Ok(value) => {
                    values.insert(dev.name().to_string(), value);
                }
                Err(e) => {
                    if self.errors.handle(Operation::Wait, Some(target), e).await?
                        == FailureAction::Skip
                    {
                        proceed = false;
                    }
                }
            }
        }

        Ok(MoveOutcome { proceed, values })
    }

    /// Start every device without waiting.
    ///
    /// Returns whether no start failure asked to skip.
    pub async fn start_devices(&self, pairs: &[(Arc<dyn Movable>, f64)]) -> ScanResult<bool> {
        let (_, proceed) = self.start_all(pairs).await?;
        Ok(proceed)
    }

    async fn start_all(
        &self,
        pairs: &[(Arc<dyn Movable>, f64)],
    ) -> ScanResult<(Vec<(Arc<dyn Movable>, f64)>, bool)> {
        let mut started = Vec::with_capacity(pairs.len());
        let mut proceed = true;
        for (dev, target) in pairs {
            debug!(device = %dev.name(), target, "Starting move");
            match dev.start(*target).await {
                Ok(()) => started.push((Arc::clone(dev), *target)),
                Err(e) => {
                    if self.errors.handle(Operation::Move, Some(*target), e).await?
                        == FailureAction::Skip
                    {
                        proceed = false;
                    }
                }
            }
        }
        Ok((started, proceed))
    }

    /// Actual positions of `devices`, reusing values returned by `wait()`.
    ///
    /// Devices that could not be read yield `None` for each of their values.
    pub async fn read_positions(
        &self,
        devices: &[Arc<dyn Movable>],
        wait_values: &BTreeMap<String, Vec<f64>>,
    ) -> ScanResult<Vec<Option<f64>>> {
        let mut xs = Vec::new();
        for dev in devices {
            if let Some(values) = wait_values.get(dev.name()) {
                xs.extend(values.iter().copied().map(Some));
                continue;
            }
            match dev.read().await {
                Ok(values) => xs.extend(values.into_iter().map(Some)),
                Err(e) => {
                    self.errors.handle(Operation::Read, None, e).await?;
                    xs.extend(std::iter::repeat(None).take(dev.value_info().len()));
                }
            }
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_mock::{ErrorConfig, ErrorScenario, MockDetector, MockMotor, MotorLimits};

    fn coordinator(policy: Arc<dyn FailurePolicy>, motors: &[MockMotor]) -> MoveCoordinator {
        let movables: Vec<Arc<dyn Movable>> = motors
            .iter()
            .map(|m| Arc::new(m.clone()) as Arc<dyn Movable>)
            .collect();
        MoveCoordinator::new(Arc::new(ErrorHandler::new(policy, movables, Vec::new())))
    }

    fn pairs(motors: &[MockMotor], targets: &[f64]) -> Vec<(Arc<dyn Movable>, f64)> {
        motors
            .iter()
            .zip(targets)
            .map(|(m, t)| (Arc::new(m.clone()) as Arc<dyn Movable>, *t))
            .collect()
    }

    #[test]
    fn default_policy_classes() {
        let policy = DefaultFailurePolicy;
        let classify = |kind| policy.classify(Operation::Move, &DeviceError::new("m", kind, ""));
        assert_eq!(classify(DeviceErrorKind::Limit), FailureAction::Skip);
        assert_eq!(classify(DeviceErrorKind::Communication), FailureAction::Skip);
        assert_eq!(classify(DeviceErrorKind::Position), FailureAction::Continue);
        assert_eq!(classify(DeviceErrorKind::Timeout), FailureAction::Continue);
        assert_eq!(classify(DeviceErrorKind::Fixed), FailureAction::Abort);
        assert_eq!(classify(DeviceErrorKind::Other), FailureAction::Abort);
    }

    #[tokio::test]
    async fn limit_failure_skips_and_other_devices_still_move() {
        let a = MockMotor::builder("a")
            .limits(MotorLimits::hard_stop(0.0, 1.0))
            .build();
        let b = MockMotor::new("b");
        let moves = coordinator(Arc::new(DefaultFailurePolicy), &[a.clone(), b.clone()]);

        let outcome = moves.move_devices(&pairs(&[a.clone(), b.clone()], &[5.0, 2.0])).await.unwrap();
        assert!(!outcome.proceed);
        assert_eq!(outcome.values.get("b"), Some(&vec![2.0]));
        assert!(!outcome.values.contains_key("a"));
        assert_eq!(b.position().await, 2.0);
    }

    #[tokio::test]
    async fn position_failure_measures_anyway() {
        let a = MockMotor::builder("a")
            .errors(ErrorConfig::scenario(ErrorScenario::Always {
                operation: "wait",
                kind: DeviceErrorKind::Position,
            }))
            .build();
        let moves = coordinator(Arc::new(DefaultFailurePolicy), &[a.clone()]);
        let outcome = moves.move_devices(&pairs(&[a], &[1.0])).await.unwrap();
        assert!(outcome.proceed);
        assert!(outcome.values.is_empty());
    }

    #[tokio::test]
    async fn fixed_device_aborts_with_context() {
        let a = MockMotor::builder("a").fixed("clamped").build();
        let moves = coordinator(Arc::new(DefaultFailurePolicy), &[a.clone()]);
        let err = moves.move_devices(&pairs(&[a], &[1.0])).await.unwrap_err();
        match err {
            ScanError::Device { op, target, source } => {
                assert_eq!(op, Operation::Move);
                assert_eq!(target, Some(1.0));
                assert_eq!(source.kind, DeviceErrorKind::Fixed);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_policy_stops_hardware_before_abort() {
        let a = MockMotor::builder("a").fixed("clamped").build();
        let b = MockMotor::new("b");
        let det = MockDetector::new("det");
        let handler = ErrorHandler::new(
            Arc::new(StrictFailurePolicy::new(DefaultFailurePolicy)),
            vec![Arc::new(a.clone()), Arc::new(b.clone())],
            vec![Arc::new(det.clone())],
        );
        let moves = MoveCoordinator::new(Arc::new(handler));
        assert!(moves.move_devices(&pairs(&[a, b.clone()], &[1.0, 1.0])).await.is_err());
        assert_eq!(b.stop_count().await, 1);
        assert_eq!(det.stop_calls().await, 1);
    }

    #[tokio::test]
    async fn read_failure_yields_none() {
        let a = MockMotor::builder("a")
            .errors(ErrorConfig::scenario(ErrorScenario::Always {
                operation: "read",
                kind: DeviceErrorKind::Communication,
            }))
            .build();
        let b = MockMotor::builder("b").initial_position(3.0).build();
        let moves = coordinator(Arc::new(DefaultFailurePolicy), &[a.clone(), b.clone()]);
        let devices: Vec<Arc<dyn Movable>> = vec![Arc::new(a), Arc::new(b)];

        let mut waited = BTreeMap::new();
        waited.insert("b".to_string(), vec![2.5]);
        let xs = moves.read_positions(&devices, &waited).await.unwrap();
        assert_eq!(xs, vec![None, Some(2.5)]);
    }
}

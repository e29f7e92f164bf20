//! Mock motor implementation.

use async_trait::async_trait;
use scan_core::{
    DeviceError, DeviceErrorKind, DeviceResult, DeviceStatus, InfoCategory, InfoEntry, Movable,
    Readable, ValueInfo,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep_until, Duration, Instant};

use crate::errors::ErrorConfig;
use crate::mode::MockMode;

// =============================================================================
// Configuration Structs
// =============================================================================

/// Limit behavior when a target exceeds boundaries
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitBehavior {
    /// Hard stop - refuse the target with a limit error
    HardStop,
    /// Clamp to limit - move to boundary without error
    Clamp,
}

/// Motor position limits configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorLimits {
    /// Lowest reachable position
    pub min_position: f64,
    /// Highest reachable position
    pub max_position: f64,
    /// What happens outside the limits
    pub behavior: LimitBehavior,
}

impl MotorLimits {
    /// Create limits with HardStop behavior
    pub fn hard_stop(min: f64, max: f64) -> Self {
        Self {
            min_position: min,
            max_position: max,
            behavior: LimitBehavior::HardStop,
        }
    }

    /// Create limits with Clamp behavior
    pub fn clamp(min: f64, max: f64) -> Self {
        Self {
            min_position: min,
            max_position: max,
            behavior: LimitBehavior::Clamp,
        }
    }

    fn check(&self, device: &str, target: f64) -> DeviceResult<()> {
        if target < self.min_position || target > self.max_position {
            return Err(DeviceError::limit(
                device,
                format!(
                    "position {:.3} exceeds limits [{:.3}, {:.3}]",
                    target, self.min_position, self.max_position
                ),
            ));
        }
        Ok(())
    }

    fn enforce(&self, device: &str, target: f64) -> DeviceResult<f64> {
        match self.behavior {
            LimitBehavior::Clamp => Ok(target.clamp(self.min_position, self.max_position)),
            LimitBehavior::HardStop => self.check(device, target).map(|()| target),
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    began: Instant,
    ends: Instant,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        if now >= self.ends {
            return self.to;
        }
        let total = self.ends.duration_since(self.began).as_secs_f64();
        if total <= 0.0 {
            return self.to;
        }
        let frac = now.duration_since(self.began).as_secs_f64() / total;
        self.from + (self.to - self.from) * frac
    }
}

#[derive(Debug)]
struct MotorState {
    position: f64,
    motion: Option<Motion>,
    speed: f64,
    accel: f64,
    started_targets: Vec<f64>,
    speed_log: Vec<f64>,
    stop_count: u32,
}

impl MotorState {
    fn current(&self, now: Instant) -> f64 {
        match &self.motion {
            Some(m) => m.position_at(now),
            None => self.position,
        }
    }
}

// =============================================================================
// MockMotor - Simulated Motor
// =============================================================================

/// Mock motor with optional timing.
///
/// Simulates a single-axis motor with:
/// - Configurable speed (units per second) and acceleration
/// - Linear position interpolation while moving (Realistic mode)
/// - Position limits with configurable behavior
/// - A fixed state that refuses any move
/// - Error injection for testing
///
/// The motor records every accepted target and every speed change so tests
/// can assert on what the engine asked for.
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::builder("omega")
///     .limits(MotorLimits::hard_stop(-10.0, 10.0))
///     .build();
///
/// motor.start(5.0).await?;
/// assert_eq!(motor.wait().await?, vec![5.0]);
/// ```
#[derive(Clone)]
pub struct MockMotor {
    name: String,
    unit: String,
    state: Arc<RwLock<MotorState>>,
    limits: Option<MotorLimits>,
    mode: MockMode,
    fixed: Option<String>,
    lowlevel: bool,
    errors: ErrorConfig,
}

impl MockMotor {
    /// Create an instant-mode motor at position 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Create a builder for configuring MockMotor
    pub fn builder(name: impl Into<String>) -> MockMotorBuilder {
        MockMotorBuilder::new(name)
    }

    /// Current position, without error injection.
    pub async fn position(&self) -> f64 {
        self.state.read().await.current(Instant::now())
    }

    /// Targets accepted by `start()`, in call order.
    pub async fn started_targets(&self) -> Vec<f64> {
        self.state.read().await.started_targets.clone()
    }

    /// Speeds set through `set_speed()`, in call order.
    pub async fn speed_log(&self) -> Vec<f64> {
        self.state.read().await.speed_log.clone()
    }

    /// How often `stop()` was called.
    pub async fn stop_count(&self) -> u32 {
        self.state.read().await.stop_count
    }

    /// The error injection handle (for call counters).
    pub fn errors(&self) -> &ErrorConfig {
        &self.errors
    }

    fn motion_duration(&self, distance: f64, speed: f64) -> Duration {
        match self.mode {
            MockMode::Instant => Duration::ZERO,
            MockMode::Realistic if speed > 0.0 => Duration::from_secs_f64(distance.abs() / speed),
            MockMode::Realistic => Duration::ZERO,
        }
    }
}

#[async_trait]
impl Readable for MockMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new(self.name.clone(), self.unit.clone())]
    }

    async fn read(&self) -> DeviceResult<Vec<f64>> {
        self.errors.check_operation(&self.name, "read")?;
        Ok(vec![self.position().await])
    }

    async fn status(&self) -> DeviceResult<DeviceStatus> {
        self.errors.check_operation(&self.name, "status")?;
        if self.fixed.is_some() {
            return Ok(DeviceStatus::Ok);
        }
        let state = self.state.read().await;
        match &state.motion {
            Some(m) if Instant::now() < m.ends => Ok(DeviceStatus::Busy),
            _ => Ok(DeviceStatus::Ok),
        }
    }

    fn lowlevel(&self) -> bool {
        self.lowlevel
    }

    async fn info(&self) -> DeviceResult<Vec<InfoEntry>> {
        let mut entries = vec![InfoEntry::new(
            InfoCategory::General,
            self.name.clone(),
            "value",
            format!("{:.3} {}", self.position().await, self.unit),
        )];
        if let Some(limits) = &self.limits {
            entries.push(InfoEntry::new(
                InfoCategory::Limits,
                self.name.clone(),
                "userlimits",
                format!("{:.3} - {:.3}", limits.min_position, limits.max_position),
            ));
        }
        Ok(entries)
    }
}

#[async_trait]
impl Movable for MockMotor {
    async fn start(&self, target: f64) -> DeviceResult<()> {
        self.errors.check_operation(&self.name, "start")?;
        self.errors.check_target(&self.name, "start", target)?;

        if let Some(reason) = &self.fixed {
            return Err(DeviceError::new(
                self.name.clone(),
                DeviceErrorKind::Fixed,
                reason.clone(),
            ));
        }

        let target = match &self.limits {
            Some(limits) => limits.enforce(&self.name, target)?,
            None => target,
        };

        let now = Instant::now();
        let mut state = self.state.write().await;
        let current = state.current(now);
        let duration = self.motion_duration(target - current, state.speed);

        tracing::debug!(
            "MockMotor {}: moving from {:.3} to {:.3} ({:?})",
            self.name,
            current,
            target,
            duration
        );

        state.started_targets.push(target);
        state.position = current;
        state.motion = Some(Motion {
            from: current,
            to: target,
            began: now,
            ends: now + duration,
        });
        Ok(())
    }

    async fn wait(&self) -> DeviceResult<Vec<f64>> {
        let motion = self.state.read().await.motion;
        if let Some(m) = motion {
            self.errors.check_target(&self.name, "wait", m.to)?;
            sleep_until(m.ends).await;
        } else {
            self.errors.check_operation(&self.name, "wait")?;
        }

        let mut state = self.state.write().await;
        let position = state.current(Instant::now());
        state.position = position;
        state.motion = None;
        Ok(vec![position])
    }

    async fn stop(&self) -> DeviceResult<()> {
        let mut state = self.state.write().await;
        let position = state.current(Instant::now());
        state.position = position;
        state.motion = None;
        state.stop_count += 1;
        tracing::debug!("MockMotor {}: stopped at {:.3}", self.name, position);
        Ok(())
    }

    async fn is_allowed(&self, target: f64) -> DeviceResult<()> {
        if let Some(reason) = &self.fixed {
            return Err(DeviceError::new(
                self.name.clone(),
                DeviceErrorKind::Fixed,
                reason.clone(),
            ));
        }
        match &self.limits {
            Some(limits) if limits.behavior == LimitBehavior::HardStop => {
                limits.check(&self.name, target)
            }
            _ => Ok(()),
        }
    }

    async fn speed(&self) -> DeviceResult<f64> {
        Ok(self.state.read().await.speed)
    }

    async fn set_speed(&self, speed: f64) -> DeviceResult<()> {
        self.errors.check_operation(&self.name, "set_speed")?;
        if speed <= 0.0 {
            return Err(DeviceError::new(
                self.name.clone(),
                DeviceErrorKind::InvalidValue,
                format!("speed must be positive, got {}", speed),
            ));
        }
        let mut state = self.state.write().await;
        state.speed = speed;
        state.speed_log.push(speed);
        Ok(())
    }

    async fn accel(&self) -> DeviceResult<f64> {
        Ok(self.state.read().await.accel)
    }

    async fn set_accel(&self, accel: f64) -> DeviceResult<()> {
        self.state.write().await.accel = accel;
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for MockMotor with fluent API
pub struct MockMotorBuilder {
    name: String,
    unit: String,
    initial_position: f64,
    speed: f64,
    accel: f64,
    limits: Option<MotorLimits>,
    mode: MockMode,
    fixed: Option<String>,
    lowlevel: bool,
    errors: ErrorConfig,
}

impl MockMotorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: "mm".to_string(),
            initial_position: 0.0,
            speed: 10.0,
            accel: 20.0,
            limits: None,
            mode: MockMode::Instant,
            fixed: None,
            lowlevel: false,
            errors: ErrorConfig::none(),
        }
    }

    /// Physical unit of the position
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Starting position
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    /// Speed in units per second
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Acceleration in units per second squared
    pub fn accel(mut self, accel: f64) -> Self {
        self.accel = accel;
        self
    }

    /// Position limits
    pub fn limits(mut self, limits: MotorLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Operational mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Refuse every move with a `Fixed` error
    pub fn fixed(mut self, reason: impl Into<String>) -> Self {
        self.fixed = Some(reason.into());
        self
    }

    /// Hide the motor from metadata snapshots
    pub fn lowlevel(mut self) -> Self {
        self.lowlevel = true;
        self
    }

    /// Error injection
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Build the motor
    pub fn build(self) -> MockMotor {
        MockMotor {
            name: self.name,
            unit: self.unit,
            state: Arc::new(RwLock::new(MotorState {
                position: self.initial_position,
                motion: None,
                speed: self.speed,
                accel: self.accel,
                started_targets: Vec::new(),
                speed_log: Vec::new(),
                stop_count: 0,
            })),
            limits: self.limits,
            mode: self.mode,
            fixed: self.fixed,
            lowlevel: self.lowlevel,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorScenario;

    #[tokio::test]
    async fn test_instant_move() {
        let motor = MockMotor::new("m");
        motor.start(5.0).await.unwrap();
        assert_eq!(motor.wait().await.unwrap(), vec![5.0]);
        assert_eq!(motor.read().await.unwrap(), vec![5.0]);
        assert_eq!(motor.started_targets().await, vec![5.0]);
    }

    #[tokio::test]
    async fn test_hard_stop_limits() {
        let motor = MockMotor::builder("m")
            .limits(MotorLimits::hard_stop(0.0, 10.0))
            .build();
        let err = motor.start(12.0).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Limit);
        assert!(motor.is_allowed(12.0).await.is_err());
        assert!(motor.is_allowed(3.0).await.is_ok());
        assert!(motor.started_targets().await.is_empty());
    }

    #[tokio::test]
    async fn test_clamp_limits() {
        let motor = MockMotor::builder("m")
            .limits(MotorLimits::clamp(0.0, 10.0))
            .build();
        motor.start(15.0).await.unwrap();
        assert_eq!(motor.wait().await.unwrap(), vec![10.0]);
    }

    #[tokio::test]
    async fn test_fixed_motor_refuses() {
        let motor = MockMotor::builder("m").fixed("locked by operator").build();
        let err = motor.start(1.0).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Fixed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_motion_is_busy() {
        let motor = MockMotor::builder("m")
            .speed(2.0)
            .mode(MockMode::Realistic)
            .build();
        motor.start(4.0).await.unwrap();
        assert_eq!(motor.status().await.unwrap(), DeviceStatus::Busy);

        tokio::time::advance(Duration::from_secs(1)).await;
        let halfway = motor.read().await.unwrap()[0];
        assert!((halfway - 2.0).abs() < 1e-6, "got {}", halfway);

        assert_eq!(motor.wait().await.unwrap(), vec![4.0]);
        assert_eq!(motor.status().await.unwrap(), DeviceStatus::Ok);
    }

    #[tokio::test]
    async fn test_injected_wait_failure() {
        let motor = MockMotor::builder("m")
            .errors(ErrorConfig::scenario(ErrorScenario::OnTarget {
                operation: "wait",
                target: 2.0,
                kind: DeviceErrorKind::Position,
            }))
            .build();
        motor.start(2.0).await.unwrap();
        let err = motor.wait().await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Position);
    }

    #[tokio::test]
    async fn test_speed_log() {
        let motor = MockMotor::new("m");
        motor.set_speed(2.0).await.unwrap();
        motor.set_speed(10.0).await.unwrap();
        assert!(motor.set_speed(0.0).await.is_err());
        assert_eq!(motor.speed_log().await, vec![2.0, 10.0]);
    }
}

//! Adaptive positions requested one by one from an external decision service.
//!
//! The service sees the result of every point and the estimated cost of
//! moving away from the current position, and answers with the next position,
//! "not yet" or "done". Positions the devices refuse (`is_allowed` fails) are
//! reported back and a new one is requested, up to a retry budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scan_core::limits::{DEFAULT_POLL_BACKOFF, DEFAULT_RETRY_BUDGET};
use scan_core::{DeviceError, DeviceErrorKind, Movable, PointRecord, ScanError, ScanResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PositionSource, SourceLen, SourceStep};
use crate::config::AdaptiveConfig;
use crate::control::ScanControl;

/// Answer of a decision service.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Measure here next
    Position(Vec<f64>),
    /// No decision yet, ask again later
    Pending,
    /// The scan is complete
    Done,
}

/// Estimated cost of moving away from a position.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCost {
    /// Position the estimate starts from
    pub origin: Vec<f64>,
    /// Travel time per unit distance, per device (`None` if unknown)
    pub seconds_per_unit: Vec<Option<f64>>,
}

impl MoveCost {
    /// Seconds to reach `target`, with all devices moving concurrently.
    ///
    /// `None` if a device that has to move has no known speed.
    pub fn time_to(&self, target: &[f64]) -> Option<f64> {
        let mut seconds: f64 = 0.0;
        for ((from, to), rate) in self.origin.iter().zip(target).zip(&self.seconds_per_unit) {
            let distance = (to - from).abs();
            if distance == 0.0 {
                continue;
            }
            seconds = seconds.max(distance * (*rate)?);
        }
        Some(seconds)
    }
}

/// External decider of adaptive positions.
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Ask for the next position; `cost` describes moves from the last point.
    async fn request_next(&mut self, cost: Option<MoveCost>) -> ScanResult<Decision>;

    /// The last decided position cannot be reached.
    async fn report_infeasible(&mut self, position: &[f64], error: &DeviceError) -> ScanResult<()>;

    /// A point finished; `None` if it was skipped.
    async fn report_result(&mut self, record: Option<&PointRecord>) -> ScanResult<()>;
}

/// Message sent by [`ChannelDecisionService`].
#[derive(Debug)]
pub enum DecisionRequest {
    /// Next position wanted, answer on `reply`
    Next {
        /// Cost of the moves from the last point
        cost: Option<MoveCost>,
        /// Where the decision goes
        reply: oneshot::Sender<Decision>,
    },
    /// A decided position was refused by a device
    Infeasible {
        /// The refused position
        position: Vec<f64>,
        /// Why it was refused
        kind: DeviceErrorKind,
        /// Device error message
        reason: String,
    },
    /// Outcome of a point
    Result {
        /// The recorded point; `None` if it was skipped
        record: Option<PointRecord>,
    },
}

/// Decision service on the far side of a tokio channel.
///
/// ```rust,ignore
/// let (service, mut requests) = ChannelDecisionService::channel(16);
/// tokio::spawn(async move {
///     while let Some(request) = requests.recv().await {
///         if let DecisionRequest::Next { reply, .. } = request {
///             let _ = reply.send(Decision::Done);
///         }
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ChannelDecisionService {
    tx: mpsc::Sender<DecisionRequest>,
}

impl ChannelDecisionService {
    /// Service and the receiving end the decider listens on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DecisionRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, request: DecisionRequest) -> ScanResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ScanError::Decision("decision service has shut down".to_string()))
    }
}

#[async_trait]
impl DecisionService for ChannelDecisionService {
    async fn request_next(&mut self, cost: Option<MoveCost>) -> ScanResult<Decision> {
        let (reply, rx) = oneshot::channel();
        self.send(DecisionRequest::Next { cost, reply }).await?;
        rx.await
            .map_err(|_| ScanError::Decision("decision service dropped the request".to_string()))
    }

    async fn report_infeasible(&mut self, position: &[f64], error: &DeviceError) -> ScanResult<()> {
        self.send(DecisionRequest::Infeasible {
            position: position.to_vec(),
            kind: error.kind,
            reason: error.to_string(),
        })
        .await
    }

    async fn report_result(&mut self, record: Option<&PointRecord>) -> ScanResult<()> {
        self.send(DecisionRequest::Result {
            record: record.cloned(),
        })
        .await
    }
}

/// Estimates move costs from a position, off the control task.
#[async_trait]
pub trait MoveCostEstimator: Send + Sync {
    /// Cost of moving away from `origin`.
    async fn estimate(&self, origin: Vec<f64>) -> ScanResult<MoveCost>;
}

/// Estimates travel time from the current device speeds.
pub struct SpeedCostEstimator {
    devices: Vec<Arc<dyn Movable>>,
}

impl SpeedCostEstimator {
    /// Estimator over the scanned devices.
    pub fn new(devices: Vec<Arc<dyn Movable>>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl MoveCostEstimator for SpeedCostEstimator {
    async fn estimate(&self, origin: Vec<f64>) -> ScanResult<MoveCost> {
        let mut seconds_per_unit = Vec::with_capacity(self.devices.len());
        for dev in &self.devices {
            // devices without a speed simply have no estimate
            let rate = match dev.speed().await {
                Ok(speed) if speed > 0.0 => Some(1.0 / speed),
                _ => None,
            };
            seconds_per_unit.push(rate);
        }
        Ok(MoveCost {
            origin,
            seconds_per_unit,
        })
    }
}

/// Position source driven by a [`DecisionService`].
pub struct AdaptiveSource {
    devices: Vec<Arc<dyn Movable>>,
    service: Box<dyn DecisionService>,
    estimator: Option<Arc<dyn MoveCostEstimator>>,
    retry_budget: u32,
    poll_backoff: Duration,
    pending_cost: Option<MoveCost>,
    estimate: Option<JoinHandle<ScanResult<MoveCost>>>,
}

impl AdaptiveSource {
    /// Source for `devices`, asking `service` for every position.
    pub fn new(devices: Vec<Arc<dyn Movable>>, service: Box<dyn DecisionService>) -> Self {
        Self {
            devices,
            service,
            estimator: None,
            retry_budget: DEFAULT_RETRY_BUDGET,
            poll_backoff: DEFAULT_POLL_BACKOFF,
            pending_cost: None,
            estimate: None,
        }
    }

    /// Send move cost estimates along with every request.
    pub fn with_estimator(mut self, estimator: Arc<dyn MoveCostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Retry budget and backoff from the engine configuration.
    pub fn with_config(mut self, config: &AdaptiveConfig) -> Self {
        self.retry_budget = config.retry_budget.max(1);
        self.poll_backoff = config.poll_backoff;
        self
    }

    async fn check_allowed(&self, position: &[f64]) -> Result<(), DeviceError> {
        for (dev, target) in self.devices.iter().zip(position) {
            dev.is_allowed(*target).await?;
        }
        Ok(())
    }
}

impl Drop for AdaptiveSource {
    fn drop(&mut self) {
        if let Some(task) = self.estimate.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl PositionSource for AdaptiveSource {
    fn len_hint(&self) -> SourceLen {
        SourceLen::External
    }

    fn arity(&self) -> Option<usize> {
        Some(self.devices.len())
    }

    async fn next_position(&mut self, control: &ScanControl) -> ScanResult<SourceStep> {
        let mut refused = 0u32;
        loop {
            control.check_immediate()?;
            match self.service.request_next(self.pending_cost.clone()).await? {
                Decision::Done => {
                    info!("Decision service finished the scan");
                    return Ok(SourceStep::Exhausted);
                }
                Decision::Pending => {
                    debug!(backoff = ?self.poll_backoff, "No decision yet");
                    control.sleep(self.poll_backoff).await?;
                }
                Decision::Position(position) => {
                    if position.len() != self.devices.len() {
                        return Err(ScanError::Decision(format!(
                            "decided position has {} values for {} devices",
                            position.len(),
                            self.devices.len()
                        )));
                    }
                    match self.check_allowed(&position).await {
                        Ok(()) => {
                            self.pending_cost = None;
                            return Ok(SourceStep::Position(position));
                        }
                        Err(e) => {
                            refused += 1;
                            warn!(?position, refused, "Decided position is not reachable: {}", e);
                            self.service.report_infeasible(&position, &e).await?;
                            if refused >= self.retry_budget {
                                return Ok(SourceStep::Terminated(format!(
                                    "{} unreachable positions in a row, last: {}",
                                    refused, e
                                )));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn on_point_started(&mut self, position: &[f64]) -> ScanResult<()> {
        if let Some(estimator) = &self.estimator {
            let estimator = Arc::clone(estimator);
            let origin = position.to_vec();
            self.estimate = Some(tokio::spawn(async move { estimator.estimate(origin).await }));
        }
        Ok(())
    }

    async fn on_point_finished(&mut self, record: Option<&PointRecord>) -> ScanResult<()> {
        if let Some(task) = self.estimate.take() {
            match task.await {
                Ok(Ok(cost)) => self.pending_cost = Some(cost),
                Ok(Err(e)) => warn!("Move cost estimate failed: {}", e),
                Err(e) => return Err(ScanError::Join(e.to_string())),
            }
        }
        self.service.report_result(record).await
    }
}

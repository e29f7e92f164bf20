//! Acquisition: one counting cycle over a set of detectors.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use scan_core::{DeviceError, Measurable, Operation, Preset, ScanError};
use tracing::{debug, instrument, warn};

use crate::control::ScanControl;

/// When a count is considered finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionCheck {
    /// Every detector reports completion
    #[default]
    AllDetectors,
    /// The first detector to complete ends the count; the others are stopped
    AnyDetector,
}

/// A failed count, with whatever could still be read.
#[derive(Debug)]
pub struct AcquisitionFailure {
    /// Readings taken after the failure, possibly empty
    pub partial: Vec<f64>,
    /// Device error (operation `Count`) or a cancellation
    pub error: ScanError,
}

/// Runs one counting cycle.
#[async_trait]
pub trait Acquisition: Send + Sync {
    /// Count with `detectors` until `preset` is reached; readings of all
    /// detectors are concatenated in detector order.
    async fn measure(
        &self,
        detectors: &[Arc<dyn Measurable>],
        preset: &Preset,
        control: &ScanControl,
    ) -> Result<Vec<f64>, AcquisitionFailure>;
}

/// Poll-based counting loop.
///
/// `set_preset` → `start` → poll `is_completed` every `delay` → `finish` →
/// `read`. On failure or immediate cancellation the remaining detectors are
/// stopped and read once, so that partial data is not lost.
#[derive(Debug, Clone)]
pub struct CountLoop {
    delay: Duration,
    completion: CompletionCheck,
}

impl CountLoop {
    /// Loop polling every `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            completion: CompletionCheck::AllDetectors,
        }
    }

    /// Use a different completion predicate.
    pub fn with_completion(mut self, completion: CompletionCheck) -> Self {
        self.completion = completion;
        self
    }

    async fn read_all(detectors: &[Arc<dyn Measurable>]) -> Result<Vec<f64>, DeviceError> {
        let mut readings = Vec::new();
        for det in detectors {
            readings.extend(det.read().await?);
        }
        Ok(readings)
    }

    async fn stop_remaining(detectors: &[Arc<dyn Measurable>], remaining: &BTreeSet<usize>) {
        let stops = join_all(remaining.iter().map(|&i| detectors[i].stop())).await;
        for (&i, result) in remaining.iter().zip(stops) {
            if let Err(e) = result {
                warn!(detector = %detectors[i].name(), "Could not stop detector: {}", e);
            }
        }
    }

    // Stop what is still counting and save what can be read.
    async fn fail(
        detectors: &[Arc<dyn Measurable>],
        remaining: &BTreeSet<usize>,
        error: ScanError,
    ) -> AcquisitionFailure {
        if !error.is_cancellation() {
            warn!("Exception during count, trying to save data: {}", error);
        }
        Self::stop_remaining(detectors, remaining).await;
        let partial = Self::read_all(detectors).await.unwrap_or_default();
        AcquisitionFailure { partial, error }
    }
}

fn count_error(error: DeviceError) -> ScanError {
    ScanError::device(Operation::Count, None, error)
}

#[async_trait]
impl Acquisition for CountLoop {
    #[instrument(skip_all, fields(detectors = detectors.len()))]
    async fn measure(
        &self,
        detectors: &[Arc<dyn Measurable>],
        preset: &Preset,
        control: &ScanControl,
    ) -> Result<Vec<f64>, AcquisitionFailure> {
        for det in detectors {
            if let Err(e) = det.set_preset(preset).await {
                return Err(AcquisitionFailure {
                    partial: Vec::new(),
                    error: count_error(e),
                });
            }
        }
        if let Err(e) = control.check_immediate() {
            return Err(AcquisitionFailure {
                partial: Vec::new(),
                error: e,
            });
        }

        let mut remaining: BTreeSet<usize> = BTreeSet::new();
        for (i, det) in detectors.iter().enumerate() {
            if let Err(e) = det.start().await {
                return Err(Self::fail(detectors, &remaining, count_error(e)).await);
            }
            remaining.insert(i);
        }
        debug!("Counting started");

        loop {
            let mut completed = false;
            for i in remaining.clone() {
                match detectors[i].is_completed().await {
                    Ok(true) => {
                        if let Err(e) = detectors[i].finish().await {
                            warn!(detector = %detectors[i].name(), "Error finishing count: {}", e);
                        }
                        remaining.remove(&i);
                        completed = true;
                    }
                    Ok(false) => {}
                    Err(e) => return Err(Self::fail(detectors, &remaining, count_error(e)).await),
                }
            }
            if remaining.is_empty() {
                break;
            }
            if completed && self.completion == CompletionCheck::AnyDetector {
                debug!(stopping = remaining.len(), "First detector completed");
                Self::stop_remaining(detectors, &remaining).await;
                break;
            }
            if let Err(e) = control.sleep(self.delay).await {
                return Err(Self::fail(detectors, &remaining, e).await);
            }
        }

        Self::read_all(detectors).await.map_err(|e| AcquisitionFailure {
            partial: Vec::new(),
            error: count_error(e),
        })
    }
}

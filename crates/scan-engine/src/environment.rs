//! Environment channels sampled (not driven) at every point.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan_core::{
    DeviceResult, DeviceStatus, InfoEntry, Movable, Operation, Readable, ScanResult, ValueInfo,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::motion::ErrorHandler;

/// How plain device channels are sampled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentSampling {
    /// One reading after the count, no interpolation
    #[default]
    Single,
    /// Average over the device history recorded during the count
    Statistics,
}

/// One environment column group.
#[derive(Clone)]
pub enum EnvChannel {
    /// Plain device value(s)
    Device(Arc<dyn Readable>),
    /// Average of the device value over the count
    Average(Arc<dyn Readable>),
    /// Minimum and maximum of the device value over the count
    MinMax(Arc<dyn Readable>),
    /// Seconds since the scan started
    ElapsedTime,
}

impl std::fmt::Debug for EnvChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvChannel({})", self.name())
    }
}

impl EnvChannel {
    /// Plain channel reading a driven device (e.g. a sweep device).
    pub fn movable(device: Arc<dyn Movable>) -> Self {
        EnvChannel::Device(Arc::new(MovableReadout(device)))
    }

    /// Display name (`T`, `T:avg`, `T:minmax`, `etime`).
    pub fn name(&self) -> String {
        match self {
            EnvChannel::Device(dev) => dev.name().to_string(),
            EnvChannel::Average(dev) => format!("{}:avg", dev.name()),
            EnvChannel::MinMax(dev) => format!("{}:minmax", dev.name()),
            EnvChannel::ElapsedTime => "etime".to_string(),
        }
    }

    /// Name of the underlying device, if any.
    pub fn device_name(&self) -> Option<&str> {
        match self {
            EnvChannel::Device(dev) | EnvChannel::Average(dev) | EnvChannel::MinMax(dev) => {
                Some(dev.name())
            }
            EnvChannel::ElapsedTime => None,
        }
    }

    /// Columns this channel contributes to the x-axis.
    pub fn value_info(&self) -> Vec<ValueInfo> {
        match self {
            EnvChannel::Device(dev) => dev.value_info(),
            EnvChannel::Average(dev) => {
                let unit = primary_unit(dev.as_ref());
                vec![ValueInfo::new(format!("{}:avg", dev.name()), unit)]
            }
            EnvChannel::MinMax(dev) => {
                let unit = primary_unit(dev.as_ref());
                vec![
                    ValueInfo::new(format!("{}:min", dev.name()), unit.clone()),
                    ValueInfo::new(format!("{}:max", dev.name()), unit),
                ]
            }
            EnvChannel::ElapsedTime => vec![ValueInfo::new("etime", "s")],
        }
    }
}

// Readout side of a driven device.
struct MovableReadout(Arc<dyn Movable>);

#[async_trait]
impl Readable for MovableReadout {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        self.0.value_info()
    }

    async fn read(&self) -> DeviceResult<Vec<f64>> {
        self.0.read().await
    }

    async fn status(&self) -> DeviceResult<DeviceStatus> {
        self.0.status().await
    }

    fn lowlevel(&self) -> bool {
        self.0.lowlevel()
    }

    async fn info(&self) -> DeviceResult<Vec<InfoEntry>> {
        self.0.info().await
    }

    async fn history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DeviceResult<Vec<(DateTime<Utc>, f64)>> {
        self.0.history(from, to).await
    }
}

fn primary_unit(dev: &dyn Readable) -> String {
    dev.value_info()
        .into_iter()
        .next()
        .map(|v| v.unit)
        .unwrap_or_default()
}

/// Time window of one acquisition.
#[derive(Debug, Clone, Copy)]
pub struct SampleWindow {
    /// Acquisition start
    pub started: DateTime<Utc>,
    /// Acquisition end
    pub finished: DateTime<Utc>,
    /// Seconds from scan start to acquisition end
    pub elapsed: f64,
}

/// Read every channel for one point.
///
/// Each channel yields exactly as many values as its [`EnvChannel::value_info`]
/// columns. Statistics sampling only applies to single-valued devices; others
/// are read once. Failed reads go through the failure policy; unless it
/// aborts, the channel's columns become `None`.
pub async fn read_environment(
    channels: &[EnvChannel],
    sampling: EnvironmentSampling,
    window: SampleWindow,
    errors: &ErrorHandler,
) -> ScanResult<Vec<Option<f64>>> {
    let mut values = Vec::new();
    for channel in channels {
        let width = channel.value_info().len();
        let statistics = sampling == EnvironmentSampling::Statistics && width == 1;
        let result = match channel {
            EnvChannel::Device(dev) if statistics => average(dev.as_ref(), window).await,
            EnvChannel::Device(dev) => dev
                .read()
                .await
                .map(|v| v.into_iter().map(Some).collect()),
            EnvChannel::Average(dev) => average(dev.as_ref(), window).await,
            EnvChannel::MinMax(dev) => min_max(dev.as_ref(), window).await,
            EnvChannel::ElapsedTime => Ok(vec![Some(window.elapsed)]),
        };
        match result {
            Ok(mut v) => {
                if v.len() != width {
                    warn!(
                        channel = %channel.name(),
                        got = v.len(),
                        expected = width,
                        "Environment reading does not match its columns"
                    );
                    v.resize(width, None);
                }
                values.extend(v);
            }
            Err(e) => {
                errors.handle(Operation::Read, None, e).await?;
                values.extend(std::iter::repeat(None).take(width));
            }
        }
    }
    Ok(values)
}

// The first history sample predates the window; it only anchors the value at
// the window start and is left out of the statistics.
async fn window_samples(dev: &dyn Readable, window: SampleWindow) -> DeviceResult<Vec<f64>> {
    let history = dev.history(window.started, window.finished).await?;
    Ok(history.into_iter().skip(1).map(|(_, v)| v).collect())
}

async fn first_value(dev: &dyn Readable) -> DeviceResult<Option<f64>> {
    Ok(dev.read().await?.into_iter().next())
}

async fn average(dev: &dyn Readable, window: SampleWindow) -> DeviceResult<Vec<Option<f64>>> {
    let samples = window_samples(dev, window).await?;
    if samples.is_empty() {
        return Ok(vec![first_value(dev).await?]);
    }
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    Ok(vec![Some(avg)])
}

async fn min_max(dev: &dyn Readable, window: SampleWindow) -> DeviceResult<Vec<Option<f64>>> {
    let samples = window_samples(dev, window).await?;
    if samples.is_empty() {
        let v = first_value(dev).await?;
        return Ok(vec![v, v]);
    }
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok(vec![Some(min), Some(max)])
}

//! Mock environment sensor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan_core::{DeviceResult, DeviceStatus, InfoCategory, InfoEntry, Readable, ValueInfo};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::ErrorConfig;

#[derive(Debug, Default)]
struct SensorState {
    value: f64,
    history: Vec<(DateTime<Utc>, f64)>,
}

/// Read-only sensor with a settable value and a recorded history.
///
/// Used as an environment device (temperature, field, ...).
#[derive(Clone)]
pub struct MockSensor {
    name: String,
    unit: String,
    category: InfoCategory,
    lowlevel: bool,
    errors: ErrorConfig,
    state: Arc<RwLock<SensorState>>,
}

impl MockSensor {
    /// Create a sensor with an initial value.
    pub fn new(name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            category: InfoCategory::Sample,
            lowlevel: false,
            errors: ErrorConfig::none(),
            state: Arc::new(RwLock::new(SensorState {
                value,
                history: Vec::new(),
            })),
        }
    }

    /// Metadata category of the sensor value.
    pub fn category(mut self, category: InfoCategory) -> Self {
        self.category = category;
        self
    }

    /// Hide from metadata snapshots.
    pub fn lowlevel(mut self) -> Self {
        self.lowlevel = true;
        self
    }

    /// Set error injection.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Change the current value.
    pub async fn set_value(&self, value: f64) {
        self.state.write().await.value = value;
    }

    /// Append a history sample.
    pub async fn record(&self, at: DateTime<Utc>, value: f64) {
        let mut state = self.state.write().await;
        state.history.push((at, value));
        state.history.sort_by_key(|(t, _)| *t);
    }
}

#[async_trait]
impl Readable for MockSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new(self.name.clone(), self.unit.clone())]
    }

    async fn read(&self) -> DeviceResult<Vec<f64>> {
        self.errors.check_operation(&self.name, "read")?;
        Ok(vec![self.state.read().await.value])
    }

    async fn status(&self) -> DeviceResult<DeviceStatus> {
        Ok(DeviceStatus::Ok)
    }

    fn lowlevel(&self) -> bool {
        self.lowlevel
    }

    async fn info(&self) -> DeviceResult<Vec<InfoEntry>> {
        let value = self.state.read().await.value;
        Ok(vec![InfoEntry::new(
            self.category,
            self.name.clone(),
            "value",
            format!("{} {}", value, self.unit),
        )])
    }

    async fn history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DeviceResult<Vec<(DateTime<Utc>, f64)>> {
        self.errors.check_operation(&self.name, "history")?;
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|(t, _)| *t >= from && *t <= to)
            .copied()
            .collect())
    }
}

//! Mock counting detector.

use async_trait::async_trait;
use scan_core::{
    DeviceError, DeviceErrorKind, DeviceResult, DeviceStatus, InfoCategory, InfoEntry, Measurable,
    Preset, Readable, ValueInfo,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::errors::ErrorConfig;
use crate::mode::MockMode;

/// Preset time used when no criterion is given.
const DEFAULT_PRESET_TIME: f64 = 1.0;

#[derive(Debug, Default)]
struct DetectorState {
    preset_time: f64,
    counting_since: Option<Instant>,
    elapsed: f64,
    presets: Vec<Preset>,
    start_calls: u32,
    prepare_calls: u32,
    finish_calls: u32,
    stop_calls: u32,
}

impl DetectorState {
    fn elapsed(&self, mode: MockMode, now: Instant) -> f64 {
        match (mode, self.counting_since) {
            (MockMode::Realistic, Some(since)) => {
                now.duration_since(since).as_secs_f64().min(self.preset_time)
            }
            _ => self.elapsed,
        }
    }
}

/// Mock detector counting at a constant rate.
///
/// Reports two values: the elapsed counting time and the counts
/// `rate * elapsed`. Counts are cumulative while a count is running, which is
/// what continuous scans rely on, and restart from zero at every `start()`.
///
/// Understands the presets `t` (seconds) and `m` (counts, converted through the
/// rate). In Instant mode a count completes as soon as it is started.
#[derive(Clone)]
pub struct MockDetector {
    name: String,
    rate: f64,
    mode: MockMode,
    lowlevel: bool,
    errors: ErrorConfig,
    state: Arc<RwLock<DetectorState>>,
}

impl MockDetector {
    /// Create an instant-mode detector counting 100 counts per second.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate(name, 100.0)
    }

    /// Create an instant-mode detector with a given count rate.
    pub fn with_rate(name: impl Into<String>, rate: f64) -> Self {
        Self {
            name: name.into(),
            rate,
            mode: MockMode::Instant,
            lowlevel: false,
            errors: ErrorConfig::none(),
            state: Arc::new(RwLock::new(DetectorState {
                preset_time: DEFAULT_PRESET_TIME,
                ..Default::default()
            })),
        }
    }

    /// Set the operational mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set error injection.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Hide from metadata snapshots.
    pub fn lowlevel(mut self) -> Self {
        self.lowlevel = true;
        self
    }

    /// Number of counts started.
    pub async fn start_calls(&self) -> u32 {
        self.state.read().await.start_calls
    }

    /// Number of `prepare()` calls.
    pub async fn prepare_calls(&self) -> u32 {
        self.state.read().await.prepare_calls
    }

    /// Number of `finish()` calls.
    pub async fn finish_calls(&self) -> u32 {
        self.state.read().await.finish_calls
    }

    /// Number of `stop()` calls.
    pub async fn stop_calls(&self) -> u32 {
        self.state.read().await.stop_calls
    }

    /// Presets received, in call order.
    pub async fn presets(&self) -> Vec<Preset> {
        self.state.read().await.presets.clone()
    }

    /// The error injection handle (for call counters).
    pub fn errors_handle(&self) -> &ErrorConfig {
        &self.errors
    }

    async fn freeze(&self) {
        let mut state = self.state.write().await;
        let elapsed = state.elapsed(self.mode, Instant::now());
        state.elapsed = elapsed;
        state.counting_since = None;
    }
}

#[async_trait]
impl Readable for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![
            ValueInfo::new(format!("{}_time", self.name), "s"),
            ValueInfo::new(self.name.clone(), "cts"),
        ]
    }

    async fn read(&self) -> DeviceResult<Vec<f64>> {
        self.errors.check_operation(&self.name, "read")?;
        let state = self.state.read().await;
        let elapsed = state.elapsed(self.mode, Instant::now());
        Ok(vec![elapsed, (self.rate * elapsed).round()])
    }

    async fn status(&self) -> DeviceResult<DeviceStatus> {
        if self.is_completed().await? {
            Ok(DeviceStatus::Ok)
        } else {
            Ok(DeviceStatus::Busy)
        }
    }

    fn lowlevel(&self) -> bool {
        self.lowlevel
    }

    async fn info(&self) -> DeviceResult<Vec<InfoEntry>> {
        Ok(vec![InfoEntry::new(
            InfoCategory::Instrument,
            self.name.clone(),
            "rate",
            format!("{} cts/s", self.rate),
        )])
    }
}

#[async_trait]
impl Measurable for MockDetector {
    fn preset_keys(&self) -> Vec<String> {
        vec!["t".to_string(), "m".to_string()]
    }

    async fn set_preset(&self, preset: &Preset) -> DeviceResult<()> {
        self.errors.check_operation(&self.name, "set_preset")?;
        let time = match (preset.get("t"), preset.get("m")) {
            (Some(t), _) => t,
            (None, Some(m)) if self.rate > 0.0 => m / self.rate,
            (None, Some(_)) => {
                return Err(DeviceError::new(
                    self.name.clone(),
                    DeviceErrorKind::InvalidValue,
                    "monitor preset needs a positive rate",
                ));
            }
            (None, None) => DEFAULT_PRESET_TIME,
        };
        if time < 0.0 {
            return Err(DeviceError::new(
                self.name.clone(),
                DeviceErrorKind::InvalidValue,
                format!("negative preset time {}", time),
            ));
        }
        let mut state = self.state.write().await;
        state.preset_time = time;
        state.presets.push(preset.clone());
        Ok(())
    }

    async fn prepare(&self) -> DeviceResult<()> {
        self.errors.check_operation(&self.name, "prepare")?;
        self.state.write().await.prepare_calls += 1;
        Ok(())
    }

    async fn start(&self) -> DeviceResult<()> {
        self.errors.check_operation(&self.name, "start")?;
        let mut state = self.state.write().await;
        state.start_calls += 1;
        match self.mode {
            MockMode::Instant => {
                state.elapsed = state.preset_time;
                state.counting_since = None;
            }
            MockMode::Realistic => {
                state.elapsed = 0.0;
                state.counting_since = Some(Instant::now());
            }
        }
        Ok(())
    }

    async fn is_completed(&self) -> DeviceResult<bool> {
        self.errors.check_operation(&self.name, "is_completed")?;
        let state = self.state.read().await;
        match state.counting_since {
            None => Ok(true),
            Some(_) => Ok(state.elapsed(self.mode, Instant::now()) >= state.preset_time),
        }
    }

    async fn finish(&self) -> DeviceResult<()> {
        self.freeze().await;
        self.state.write().await.finish_calls += 1;
        Ok(())
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.freeze().await;
        self.state.write().await.stop_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_instant_count_uses_time_preset() {
        let det = MockDetector::with_rate("det", 50.0);
        det.set_preset(&Preset::new().with("t", 2.0)).await.unwrap();
        det.start().await.unwrap();
        assert!(det.is_completed().await.unwrap());
        det.finish().await.unwrap();
        assert_eq!(det.read().await.unwrap(), vec![2.0, 100.0]);
    }

    #[tokio::test]
    async fn test_monitor_preset_converts_through_rate() {
        let det = MockDetector::with_rate("det", 10.0);
        det.set_preset(&Preset::new().with("m", 30.0)).await.unwrap();
        det.start().await.unwrap();
        assert_eq!(det.read().await.unwrap(), vec![3.0, 30.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_counts_are_cumulative() {
        let det = MockDetector::with_rate("det", 10.0).mode(MockMode::Realistic);
        det.set_preset(&Preset::new().with("t", 5.0)).await.unwrap();
        det.start().await.unwrap();
        assert!(!det.is_completed().await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        let first = det.read().await.unwrap()[1];
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = det.read().await.unwrap()[1];
        assert_eq!(first, 10.0);
        assert_eq!(second, 30.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(det.is_completed().await.unwrap());
        assert_eq!(det.read().await.unwrap()[1], 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_counts() {
        let det = MockDetector::with_rate("det", 10.0).mode(MockMode::Realistic);
        det.set_preset(&Preset::new().with("t", 100.0)).await.unwrap();
        det.start().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        det.stop().await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(det.read().await.unwrap()[1], 20.0);
        assert_eq!(det.stop_calls().await, 1);
    }
}

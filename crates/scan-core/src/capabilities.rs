//! Device Capabilities
//!
//! The scan engine never talks to hardware directly. It drives devices through
//! three small capability traits:
//!
//! - [`Readable`]: anything that reports a value (sensors, environment devices)
//! - [`Movable`]: a `Readable` that can be driven to a target (motors, power supplies)
//! - [`Measurable`]: a `Readable` that counts until a preset is reached (detectors)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`DeviceResult`] so failures carry a [`DeviceErrorKind`]
//!   the engine's failure policy can classify
//! - Splits long operations into a non-blocking start and a blocking wait
//!
//! The split is what allows the engine to start every device of a point before
//! waiting on any of them, so that independent hardware moves concurrently while
//! the controller stays single-threaded.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Slit { name: String, width: Mutex<f64> }
//!
//! #[async_trait]
//! impl Readable for Slit {
//!     fn name(&self) -> &str { &self.name }
//!     async fn read(&self) -> DeviceResult<Vec<f64>> { Ok(vec![*self.width.lock().await]) }
//!     async fn status(&self) -> DeviceResult<DeviceStatus> { Ok(DeviceStatus::Ok) }
//! }
//!
//! #[async_trait]
//! impl Movable for Slit {
//!     async fn start(&self, target: f64) -> DeviceResult<()> {
//!         *self.width.lock().await = target;
//!         Ok(())
//!     }
//!     async fn wait(&self) -> DeviceResult<Vec<f64>> { self.read().await }
//! }
//! ```
//!
//! [`DeviceErrorKind`]: crate::DeviceErrorKind

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::InfoEntry;
use crate::error::{DeviceError, DeviceResult};
use crate::preset::Preset;

// =============================================================================
// Status & Value Description
// =============================================================================

/// Coarse device status, as reported by a non-blocking status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Idle and healthy
    Ok,
    /// Moving or counting
    Busy,
    /// Usable, with a warning condition
    Warn,
    /// Faulted
    Error,
    /// Switched off or disabled
    Disabled,
    /// Status could not be determined
    Unknown,
}

impl DeviceStatus {
    /// Whether the device is still moving or counting.
    pub fn is_busy(&self) -> bool {
        matches!(self, DeviceStatus::Busy)
    }
}

/// Name and unit of one value a device reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    /// Column name
    pub name: String,
    /// Physical unit (may be empty)
    pub unit: String,
}

impl ValueInfo {
    /// Create a value description.
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }
}

// =============================================================================
// Readable - Value Readout
// =============================================================================

/// Capability: report one or more values.
///
/// # Contract
/// - `read()` returns as many values as `value_info()` describes
/// - `status()` must not block on hardware motion
///
/// # Example
///
/// ```rust,ignore
/// let values = sensor.read().await?;
/// for (info, value) in sensor.value_info().iter().zip(values) {
///     println!("{} = {} {}", info.name, value, info.unit);
/// }
/// ```
#[async_trait]
pub trait Readable: Send + Sync {
    /// Unique device name.
    fn name(&self) -> &str;

    /// Description of the values returned by `read()`.
    ///
    /// Defaults to a single value named after the device.
    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new(self.name(), "")]
    }

    /// Read the current value(s).
    async fn read(&self) -> DeviceResult<Vec<f64>>;

    /// Query the current status without blocking.
    async fn status(&self) -> DeviceResult<DeviceStatus>;

    /// Low-level devices are left out of dataset metadata snapshots.
    fn lowlevel(&self) -> bool {
        false
    }

    /// Metadata entries describing the device.
    async fn info(&self) -> DeviceResult<Vec<InfoEntry>> {
        Ok(Vec::new())
    }

    /// Recorded values between two instants, oldest first.
    ///
    /// Devices without a history return an empty series; consumers then fall
    /// back to a single `read()`.
    async fn history(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> DeviceResult<Vec<(DateTime<Utc>, f64)>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Movable - Driven Devices
// =============================================================================

/// Capability: drive a device to a target value.
///
/// # Contract
/// - `start()` returns as soon as the device accepted the target
/// - `wait()` blocks until the device settled and returns the value reached
/// - `is_allowed()` checks limits without touching the hardware
/// - Speed and acceleration are optional; the defaults report `Unsupported`
#[async_trait]
pub trait Movable: Readable {
    /// Start moving to `target` and return without waiting.
    async fn start(&self, target: f64) -> DeviceResult<()>;

    /// Block until the current movement finished; returns the value reached.
    async fn wait(&self) -> DeviceResult<Vec<f64>>;

    /// Stop the movement.
    async fn stop(&self) -> DeviceResult<()> {
        Err(DeviceError::unsupported(self.name(), "stop"))
    }

    /// Check whether `target` may be moved to.
    ///
    /// Returns a `Limit` or `InvalidValue` error describing why not.
    async fn is_allowed(&self, _target: f64) -> DeviceResult<()> {
        Ok(())
    }

    /// Current movement speed.
    async fn speed(&self) -> DeviceResult<f64> {
        Err(DeviceError::unsupported(self.name(), "speed"))
    }

    /// Set the movement speed.
    async fn set_speed(&self, _speed: f64) -> DeviceResult<()> {
        Err(DeviceError::unsupported(self.name(), "speed"))
    }

    /// Current acceleration.
    async fn accel(&self) -> DeviceResult<f64> {
        Err(DeviceError::unsupported(self.name(), "accel"))
    }

    /// Set the acceleration.
    async fn set_accel(&self, _accel: f64) -> DeviceResult<()> {
        Err(DeviceError::unsupported(self.name(), "accel"))
    }
}

// =============================================================================
// Measurable - Counting Detectors
// =============================================================================

/// Capability: count until a preset is reached.
///
/// A counting cycle is `set_preset → start → is_completed* → finish → read`.
/// Detectors that count cumulatively (continuous scans) are started once and
/// read repeatedly while counting.
#[async_trait]
pub trait Measurable: Readable {
    /// Preset keys this detector understands.
    fn preset_keys(&self) -> Vec<String>;

    /// Configure the termination criteria for the next count.
    async fn set_preset(&self, preset: &Preset) -> DeviceResult<()>;

    /// Prepare for a point (arm, clear buffers).
    async fn prepare(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Start counting.
    async fn start(&self) -> DeviceResult<()>;

    /// Whether the preset has been reached.
    async fn is_completed(&self) -> DeviceResult<bool>;

    /// Finish the count normally.
    async fn finish(&self) -> DeviceResult<()>;

    /// Abort counting.
    async fn stop(&self) -> DeviceResult<()>;
}

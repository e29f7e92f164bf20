//! Error types for devices and scans.
//!
//! Two layers of errors exist:
//!
//! - **`DeviceError`**: raised by a device implementation. It carries a
//!   [`DeviceErrorKind`] so that the engine's failure policy can decide
//!   whether a failed move or count should skip the point, be ignored, or
//!   abort the whole run.
//! - **`ScanError`**: what the engine returns to its caller. Device errors
//!   that the policy does not swallow are wrapped in [`ScanError::Device`]
//!   together with the operation and target that failed.
//!
//! ## Error categories
//!
//! 1. **Configuration errors** (`ScanError::Config`): mismatched list lengths,
//!    non-positive point counts, bad presets. Raised while building a plan,
//!    before any hardware is touched.
//! 2. **Positioning and acquisition errors** (`ScanError::Device`): limit
//!    violations, mechanical faults, disabled devices. Routed through the
//!    failure policy first.
//! 3. **Cancellation** (`ScanError::Cancelled`): a requested stop honoured at a
//!    breakpoint. Never a hardware error; cleanup has already run when the
//!    caller sees it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Device Errors
// =============================================================================

/// Classification of a device failure.
///
/// The kind, not the message, is what failure policies look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorKind {
    /// Target outside the configured limits
    Limit,
    /// Value rejected by the device (wrong type, out of range)
    InvalidValue,
    /// Bus or network communication failed
    Communication,
    /// Derived value could not be computed (e.g. inverse kinematics)
    Computation,
    /// Device reached a position other than the target
    Position,
    /// Mechanical movement fault
    Move,
    /// Device did not finish in time
    Timeout,
    /// Device is fixed and refuses to move
    Fixed,
    /// Device is disabled
    Disabled,
    /// Requested operation is not supported by this device
    Unsupported,
    /// Anything else
    Other,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceErrorKind::Limit => "limit",
            DeviceErrorKind::InvalidValue => "invalid_value",
            DeviceErrorKind::Communication => "communication",
            DeviceErrorKind::Computation => "computation",
            DeviceErrorKind::Position => "position",
            DeviceErrorKind::Move => "move",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Fixed => "fixed",
            DeviceErrorKind::Disabled => "disabled",
            DeviceErrorKind::Unsupported => "unsupported",
            DeviceErrorKind::Other => "other",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a device handle.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    /// Name of the device that failed
    pub device: String,
    /// Failure classification
    pub kind: DeviceErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl DeviceError {
    /// Create a new device error.
    pub fn new(device: impl Into<String>, kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// Target outside the device limits.
    pub fn limit(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DeviceErrorKind::Limit, message)
    }

    /// Communication failure.
    pub fn communication(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DeviceErrorKind::Communication, message)
    }

    /// Operation not supported by the device.
    pub fn unsupported(device: impl Into<String>, operation: &str) -> Self {
        Self::new(
            device,
            DeviceErrorKind::Unsupported,
            format!("{} not supported", operation),
        )
    }
}

/// Result alias for device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

// =============================================================================
// Scan Errors
// =============================================================================

/// The phase of a point in which a device error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Detector preparation before a point
    Prepare,
    /// Starting a movement
    Move,
    /// Waiting for a movement to finish
    Wait,
    /// Reading a position or environment value
    Read,
    /// Counting with the detectors
    Count,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Prepare => "prepare",
            Operation::Move => "move",
            Operation::Wait => "wait",
            Operation::Read => "read",
            Operation::Count => "count",
        };
        write!(f, "{}", label)
    }
}

/// How far a requested stop reaches.
///
/// Ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLevel {
    /// Stop at the next opportunity, including inside polling loops
    Immediate,
    /// Stop once the current point has finished
    AfterPoint,
    /// Let the current scan finish, then stop
    AfterScan,
}

impl fmt::Display for StopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopLevel::Immediate => "immediate",
            StopLevel::AfterPoint => "after point",
            StopLevel::AfterScan => "after scan",
        };
        write!(f, "{}", label)
    }
}

fn at_target(target: &Option<f64>) -> String {
    match target {
        Some(value) => format!(" at target {}", value),
        None => String::new(),
    }
}

/// Primary error type of the scan engine.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The scan description is inconsistent.
    ///
    /// Raised synchronously while building a plan, before hardware is touched.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A device failure the failure policy decided not to swallow.
    #[error("{op} failed{}: {source}", at_target(.target))]
    Device {
        /// Operation that failed
        op: Operation,
        /// Target value of a failed move, if any
        target: Option<f64>,
        /// Underlying device error
        #[source]
        source: DeviceError,
    },

    /// A data sink rejected a lifecycle callback.
    #[error("Data sink '{sink}' failed: {message}")]
    Sink {
        /// Sink name
        sink: String,
        /// Failure detail
        message: String,
    },

    /// The external decision service failed or closed its channel.
    #[error("Decision service error: {0}")]
    Decision(String),

    /// A requested stop was honoured at a breakpoint.
    #[error("Scan cancelled ({0})")]
    Cancelled(StopLevel),

    /// The position source gave up (e.g. adaptive retry budget exhausted).
    #[error("Scan terminated: {0}")]
    Terminated(String),

    /// `run()` was called twice on the same controller.
    #[error("Scan has already been run; build a new plan")]
    AlreadyRun,

    /// A manual scan is already open.
    #[error("Cannot start manual scan while another manual scan is active")]
    ManualScanActive,

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Join(String),
}

impl ScanError {
    /// Wrap a device error with its operation context.
    pub fn device(op: Operation, target: Option<f64>, source: DeviceError) -> Self {
        ScanError::Device { op, target, source }
    }

    /// Whether this error is a honoured stop request rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ScanError::Cancelled(_))
    }

    /// The underlying device error, if this is one.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            ScanError::Device { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result alias for engine operations.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

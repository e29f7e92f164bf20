//! Mock Devices for the scan engine
//!
//! This crate provides simulated devices for testing without physical hardware.
//! All mock devices use async-safe timing (tokio::time, not std::thread::sleep),
//! so tests can run them under a paused clock.
//!
//! # Available Mock Devices
//!
//! - [`MockMotor`] - `Movable` motor with limits, speed and interpolated motion
//! - [`MockDetector`] - `Measurable` detector counting at a constant rate
//! - [`MockSensor`] - `Readable` environment device with a value history
//!
//! Every device accepts an [`ErrorConfig`] to inject failures of a chosen
//! [`DeviceErrorKind`](scan_core::DeviceErrorKind) per operation, per call or
//! per target.

pub mod errors;
pub mod mode;
mod detector;
mod motor;
mod sensor;

pub use detector::MockDetector;
pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use motor::{LimitBehavior, MockMotor, MockMotorBuilder, MotorLimits};
pub use sensor::MockSensor;

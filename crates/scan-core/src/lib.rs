//! Core types and traits for the scan engine.
//!
//! This crate holds everything the engine and device implementations must
//! agree on, and nothing that drives a scan:
//!
//! - [`capabilities`]: the device capability traits (`Readable`, `Movable`,
//!   `Measurable`) consumed by the engine
//! - [`error`]: the device error taxonomy and the engine-level [`ScanError`]
//! - [`dataset`]: the dataset model that sinks receive
//! - [`preset`]: count-termination criteria
//! - [`limits`]: shared defaults and hard limits
//!
//! Device drivers depend on this crate only; the orchestration lives in
//! `scan-engine`.

pub mod capabilities;
pub mod dataset;
pub mod error;
pub mod limits;
pub mod preset;

pub use capabilities::{DeviceStatus, Measurable, Movable, Readable, ValueInfo};
pub use dataset::{Dataset, InfoCategory, InfoEntry, PointRecord};
pub use error::{
    DeviceError, DeviceErrorKind, DeviceResult, Operation, ScanError, ScanResult, StopLevel,
};
pub use preset::Preset;

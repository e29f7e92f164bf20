//! Dataset model handed to data sinks.
//!
//! A [`Dataset`] is created when a scan begins, grows by one [`PointRecord`]
//! per recorded point, and is closed when the scan ends. Sinks only ever see
//! a shared reference for the duration of a callback.
//!
//! # Column layout
//!
//! ```text
//! x: [device values...][environment values...]
//! y: [detector values for sub-step 0][detector values for sub-step 1]...
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capabilities::ValueInfo;
use crate::preset::Preset;

/// Generate a new unique dataset ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Metadata category, in the order sinks receive them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoCategory {
    /// Experiment information
    Experiment,
    /// Sample and alignment
    Sample,
    /// Instrument setup
    Instrument,
    /// Offsets
    Offsets,
    /// Limits
    Limits,
    /// Precisions and tolerances
    Precisions,
    /// Device status at scan start
    Status,
    /// Everything else
    General,
}

impl InfoCategory {
    /// All categories in sink order.
    pub const ALL: [InfoCategory; 8] = [
        InfoCategory::Experiment,
        InfoCategory::Sample,
        InfoCategory::Instrument,
        InfoCategory::Offsets,
        InfoCategory::Limits,
        InfoCategory::Precisions,
        InfoCategory::Status,
        InfoCategory::General,
    ];

    /// Section title for human-readable sinks.
    pub fn description(&self) -> &'static str {
        match self {
            InfoCategory::Experiment => "Experiment information",
            InfoCategory::Sample => "Sample and alignment",
            InfoCategory::Instrument => "Instrument setup",
            InfoCategory::Offsets => "Offsets",
            InfoCategory::Limits => "Limits",
            InfoCategory::Precisions => "Precisions",
            InfoCategory::Status => "Device status",
            InfoCategory::General => "Instrument state at first scan point",
        }
    }
}

impl fmt::Display for InfoCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// One metadata value of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEntry {
    /// Category the entry is filed under
    pub category: InfoCategory,
    /// Device the entry belongs to
    pub device: String,
    /// Parameter name
    pub key: String,
    /// Formatted value
    pub value: String,
}

impl InfoEntry {
    /// Create a metadata entry.
    pub fn new(
        category: InfoCategory,
        device: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            category,
            device: device.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One recorded point. Immutable once pushed onto a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    /// 1-based point number
    pub number: usize,
    /// Device positions then environment values; `None` if unreadable
    pub xs: Vec<Option<f64>>,
    /// Detector values of all sub-steps, concatenated
    pub ys: Vec<f64>,
    /// Acquisition start
    pub started: DateTime<Utc>,
    /// Acquisition end
    pub finished: DateTime<Utc>,
}

/// The dataset of one scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Unique dataset identifier
    pub uid: String,
    /// Monotonic scan counter
    pub number: u64,
    /// Scan kind label (`range`, `sweep`, ...)
    pub kind: String,
    /// Free-text description
    pub description: String,
    /// Device values followed by environment values
    pub x_info: Vec<ValueInfo>,
    /// How many trailing x columns are environment values
    pub env_count: usize,
    /// Detector values times multistep count
    pub y_info: Vec<ValueInfo>,
    /// Recorded points in acquisition order
    pub points: Vec<PointRecord>,
    /// Metadata snapshot of non-hidden devices
    pub metadata: BTreeMap<InfoCategory, Vec<InfoEntry>>,
    /// Count preset used for every point
    pub preset: Preset,
    /// Expected number of points, 0 if unknown
    pub npoints: usize,
    /// Point currently in progress (1-based, 0 before the first)
    pub current_point: usize,
    /// Free-form information for sinks (e.g. `continuation`)
    pub sink_info: BTreeMap<String, String>,
    /// When BeginScan ran
    pub started: DateTime<Utc>,
    /// When EndScan ran
    pub finished: Option<DateTime<Utc>>,
}

impl Dataset {
    /// Create an empty dataset with a fresh UID.
    pub fn new(number: u64, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            uid: new_uid(),
            number,
            kind: kind.into(),
            description: description.into(),
            x_info: Vec::new(),
            env_count: 0,
            y_info: Vec::new(),
            points: Vec::new(),
            metadata: BTreeMap::new(),
            preset: Preset::default(),
            npoints: 0,
            current_point: 0,
            sink_info: BTreeMap::new(),
            started: Utc::now(),
            finished: None,
        }
    }

    /// Number of x columns that are driven devices.
    pub fn device_count(&self) -> usize {
        self.x_info.len().saturating_sub(self.env_count)
    }

    /// Names of the x columns.
    pub fn x_names(&self) -> Vec<&str> {
        self.x_info.iter().map(|v| v.name.as_str()).collect()
    }

    /// Units of the x columns.
    pub fn x_units(&self) -> Vec<&str> {
        self.x_info.iter().map(|v| v.unit.as_str()).collect()
    }

    /// Names of the y columns.
    pub fn y_names(&self) -> Vec<&str> {
        self.y_info.iter().map(|v| v.name.as_str()).collect()
    }

    /// Units of the y columns.
    pub fn y_units(&self) -> Vec<&str> {
        self.y_info.iter().map(|v| v.unit.as_str()).collect()
    }

    /// All values of one x column.
    pub fn x_column(&self, index: usize) -> Vec<Option<f64>> {
        self.points
            .iter()
            .map(|p| p.xs.get(index).copied().flatten())
            .collect()
    }

    /// All values of one y column.
    pub fn y_column(&self, index: usize) -> Vec<Option<f64>> {
        self.points.iter().map(|p| p.ys.get(index).copied()).collect()
    }

    /// Append a recorded point.
    pub fn push_point(&mut self, point: PointRecord) {
        self.points.push(point);
    }

    /// Mark the dataset finished.
    pub fn close(&mut self) {
        self.finished = Some(Utc::now());
    }

    /// Whether EndScan has run.
    pub fn is_closed(&self) -> bool {
        self.finished.is_some()
    }
}

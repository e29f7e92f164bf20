//! Count-termination criteria.
//!
//! A preset maps criterion names (`t` for time, `m` for monitor counts, ...)
//! to values. Detectors advertise the keys they understand through
//! [`Measurable::preset_keys`](crate::Measurable::preset_keys); the engine
//! itself only interprets `delay` (sweep scans) and leaves the rest to the
//! detectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ordered mapping of preset names to values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preset(BTreeMap<String, f64>);

impl Preset {
    /// Empty preset; detectors use their own defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Insert or replace a criterion.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) -> Option<f64> {
        self.0.insert(key.into(), value)
    }

    /// Look up a criterion.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// Remove a criterion and return its value.
    pub fn take(&mut self, key: &str) -> Option<f64> {
        self.0.remove(key)
    }

    /// Whether no criteria are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate criteria in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Keys not contained in `known`.
    pub fn unrecognized<'a>(&'a self, known: &[String]) -> Vec<&'a str> {
        self.0
            .keys()
            .filter(|key| !known.iter().any(|k| k == *key))
            .map(String::as_str)
            .collect()
    }
}

impl FromIterator<(String, f64)> for Preset {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

//! Pre-computed position lists.

use async_trait::async_trait;
use scan_core::limits::{validate_point_count, MAX_POINTS};
use scan_core::{ScanError, ScanResult};

use super::{PositionSource, SourceLen, SourceStep};
use crate::control::ScanControl;

/// A fixed, pre-computed sequence of positions.
#[derive(Debug, Clone)]
pub struct ListSource {
    positions: Vec<Vec<f64>>,
    arity: usize,
    index: usize,
    // points per row of a grid; a break is emitted between rows
    row_len: Option<usize>,
    pending_break: bool,
}

/// Number of points from `start` to `end` in steps of `step`.
///
/// Rounds to absorb float drift (30 → 30.19 in steps of 0.1 gives 3 points).
/// Fewer than two points, or a step pointing away from `end`, is a
/// configuration error.
pub fn count_to_end(start: f64, step: f64, end: f64) -> ScanResult<usize> {
    if step == 0.0 || !step.is_finite() {
        return Err(ScanError::Config(format!("invalid step width {}", step)));
    }
    let count = ((end - start) / step + 1.0).round();
    if !count.is_finite() || count < 2.0 {
        return Err(ScanError::Config(format!(
            "range {} to {} in steps of {} gives {} points, need at least 2",
            start, end, step, count
        )));
    }
    validate_point_count(count as usize, MAX_POINTS)
}

fn check_same_len(what: &str, lens: &[usize]) -> ScanResult<()> {
    if lens.windows(2).any(|w| w[0] != w[1]) {
        return Err(ScanError::Config(format!(
            "all {} must have the same length, got {:?}",
            what, lens
        )));
    }
    Ok(())
}

impl ListSource {
    fn from_positions(positions: Vec<Vec<f64>>, arity: usize) -> ScanResult<Self> {
        validate_point_count(positions.len(), MAX_POINTS)?;
        Ok(Self {
            positions,
            arity,
            index: 0,
            row_len: None,
            pending_break: false,
        })
    }

    /// `n` equidistant points per device: `start + i * step`.
    pub fn equidistant(starts: &[f64], steps: &[f64], n: usize) -> ScanResult<Self> {
        check_same_len("start and step lists", &[starts.len(), steps.len()])?;
        if n < 1 {
            return Err(ScanError::Config(
                "number of points must be at least 1".to_string(),
            ));
        }
        validate_point_count(n, MAX_POINTS)?;
        let positions = (0..n)
            .map(|i| {
                starts
                    .iter()
                    .zip(steps)
                    .map(|(start, step)| start + i as f64 * step)
                    .collect()
            })
            .collect();
        Self::from_positions(positions, starts.len())
    }

    /// One device from `start` towards `end` in steps of `step`.
    ///
    /// The last point may overshoot `end` by less than half a step.
    pub fn equidistant_to_end(start: f64, step: f64, end: f64) -> ScanResult<Self> {
        let n = count_to_end(start, step, end)?;
        Self::equidistant(&[start], &[step], n)
    }

    /// Explicit positions, one list per device.
    pub fn explicit(lists: Vec<Vec<f64>>) -> ScanResult<Self> {
        if lists.is_empty() {
            return Err(ScanError::Config("no position lists given".to_string()));
        }
        let lens: Vec<usize> = lists.iter().map(Vec::len).collect();
        check_same_len("position lists", &lens)?;
        let n = lens[0];
        if n == 0 {
            return Err(ScanError::Config("position lists are empty".to_string()));
        }
        let positions = (0..n)
            .map(|i| lists.iter().map(|list| list[i]).collect())
            .collect();
        Self::from_positions(positions, lists.len())
    }

    /// `2 * numperside + 1` points centered on each device's center.
    pub fn centered(centers: &[f64], steps: &[f64], numperside: usize) -> ScanResult<Self> {
        check_same_len("center and step lists", &[centers.len(), steps.len()])?;
        if numperside < 1 {
            return Err(ScanError::Config(
                "number of points per side must be at least 1".to_string(),
            ));
        }
        let starts: Vec<f64> = centers
            .iter()
            .zip(steps)
            .map(|(center, step)| center - numperside as f64 * step)
            .collect();
        Self::equidistant(&starts, steps, 2 * numperside + 1)
    }

    /// Cartesian product: every `inner` position for each `outer` position.
    ///
    /// With `snake`, odd rows run the inner positions in reverse so the inner
    /// devices never travel back to the row start.
    pub fn grid(outer: ListSource, inner: ListSource, snake: bool) -> ScanResult<Self> {
        let rows = outer.positions.len();
        let cols = inner.positions.len();
        let total = rows.checked_mul(cols).ok_or_else(|| {
            ScanError::Config("grid size overflows".to_string())
        })?;
        validate_point_count(total, MAX_POINTS)?;

        let mut positions = Vec::with_capacity(total);
        for (row, outer_pos) in outer.positions.iter().enumerate() {
            let reverse = snake && row % 2 == 1;
            for col in 0..cols {
                let inner_pos = if reverse {
                    &inner.positions[cols - 1 - col]
                } else {
                    &inner.positions[col]
                };
                positions.push(outer_pos.iter().chain(inner_pos).copied().collect());
            }
        }
        let mut source = Self::from_positions(positions, outer.arity + inner.arity)?;
        source.row_len = Some(cols);
        Ok(source)
    }

    /// All positions, in scan order.
    pub fn positions(&self) -> &[Vec<f64>] {
        &self.positions
    }
}

#[async_trait]
impl PositionSource for ListSource {
    fn len_hint(&self) -> SourceLen {
        SourceLen::Known(self.positions.len())
    }

    fn arity(&self) -> Option<usize> {
        Some(self.arity)
    }

    async fn next_position(&mut self, _control: &ScanControl) -> ScanResult<SourceStep> {
        let Some(position) = self.positions.get(self.index) else {
            return Ok(SourceStep::Exhausted);
        };
        if let Some(row_len) = self.row_len {
            self.pending_break = self.index > 0 && row_len > 0 && self.index % row_len == 0;
        }
        self.index += 1;
        Ok(SourceStep::Position(position.clone()))
    }

    fn take_break(&mut self) -> bool {
        std::mem::take(&mut self.pending_break)
    }
}

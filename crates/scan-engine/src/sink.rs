//! Data sinks: consumers of dataset lifecycle events.
//!
//! The engine calls every sink, in registration order, at each lifecycle step:
//!
//! ```text
//! prepare_dataset → begin_dataset → add_info (per category)
//!     → { add_point | add_break }* → end_dataset
//! ```
//!
//! Sinks get the dataset by shared reference for the duration of a callback
//! only. A failing sink aborts the run; `end_dataset` is still delivered.

use async_trait::async_trait;
use scan_core::{Dataset, InfoCategory, InfoEntry, ScanResult};
use serde::Serialize;
use tokio::sync::Mutex;

/// Consumer of dataset lifecycle events.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Sink name, used in error messages.
    fn name(&self) -> &str;

    /// Called before the dataset begins (e.g. allocate a file number).
    async fn prepare_dataset(&self, _dataset: &Dataset) -> ScanResult<()> {
        Ok(())
    }

    /// Dataset header is complete.
    async fn begin_dataset(&self, dataset: &Dataset) -> ScanResult<()>;

    /// Metadata of one category.
    async fn add_info(
        &self,
        dataset: &Dataset,
        category: InfoCategory,
        entries: &[InfoEntry],
    ) -> ScanResult<()>;

    /// A point was recorded.
    async fn add_point(&self, dataset: &Dataset, xs: &[Option<f64>], ys: &[f64]) -> ScanResult<()>;

    /// Structural break between point groups (e.g. a new grid row).
    async fn add_break(&self, _dataset: &Dataset) -> ScanResult<()> {
        Ok(())
    }

    /// Dataset is closed.
    async fn end_dataset(&self, dataset: &Dataset) -> ScanResult<()>;
}

/// Lifecycle event as recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    /// `prepare_dataset`
    Prepare {
        /// Dataset uid
        uid: String,
    },
    /// `begin_dataset`
    Begin {
        /// Dataset uid
        uid: String,
    },
    /// `add_info`
    Info {
        /// Metadata category
        category: InfoCategory,
        /// Number of entries
        entries: usize,
    },
    /// `add_point`
    Point {
        /// Position and environment values
        xs: Vec<Option<f64>>,
        /// Detector values
        ys: Vec<f64>,
    },
    /// `add_break`
    Break,
    /// `end_dataset`
    End {
        /// Dataset uid
        uid: String,
        /// Points recorded
        points: usize,
    },
}

#[derive(Default)]
struct MemoryState {
    events: Vec<SinkEvent>,
    datasets: Vec<Dataset>,
}

/// Sink keeping every event and every finished dataset in memory.
#[derive(Default)]
pub struct MemorySink {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Events received so far.
    pub async fn events(&self) -> Vec<SinkEvent> {
        self.state.lock().await.events.clone()
    }

    /// Datasets that reached `end_dataset`.
    pub async fn datasets(&self) -> Vec<Dataset> {
        self.state.lock().await.datasets.clone()
    }

    /// Number of `end_dataset` calls.
    pub async fn end_count(&self) -> usize {
        self.state
            .lock()
            .await
            .events
            .iter()
            .filter(|e| matches!(e, SinkEvent::End { .. }))
            .count()
    }

    async fn push(&self, event: SinkEvent) {
        self.state.lock().await.events.push(event);
    }
}

#[async_trait]
impl DataSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare_dataset(&self, dataset: &Dataset) -> ScanResult<()> {
        self.push(SinkEvent::Prepare {
            uid: dataset.uid.clone(),
        })
        .await;
        Ok(())
    }

    async fn begin_dataset(&self, dataset: &Dataset) -> ScanResult<()> {
        self.push(SinkEvent::Begin {
            uid: dataset.uid.clone(),
        })
        .await;
        Ok(())
    }

    async fn add_info(
        &self,
        _dataset: &Dataset,
        category: InfoCategory,
        entries: &[InfoEntry],
    ) -> ScanResult<()> {
        self.push(SinkEvent::Info {
            category,
            entries: entries.len(),
        })
        .await;
        Ok(())
    }

    async fn add_point(&self, _dataset: &Dataset, xs: &[Option<f64>], ys: &[f64]) -> ScanResult<()> {
        self.push(SinkEvent::Point {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
        })
        .await;
        Ok(())
    }

    async fn add_break(&self, _dataset: &Dataset) -> ScanResult<()> {
        self.push(SinkEvent::Break).await;
        Ok(())
    }

    async fn end_dataset(&self, dataset: &Dataset) -> ScanResult<()> {
        let mut state = self.state.lock().await;
        state.events.push(SinkEvent::End {
            uid: dataset.uid.clone(),
            points: dataset.points.len(),
        });
        state.datasets.push(dataset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_records_lifecycle() {
        let sink = MemorySink::new("memory");
        let ds = Dataset::new(1, "range", "");
        sink.prepare_dataset(&ds).await.unwrap();
        sink.begin_dataset(&ds).await.unwrap();
        sink.add_point(&ds, &[Some(1.0)], &[2.0]).await.unwrap();
        sink.add_break(&ds).await.unwrap();
        sink.end_dataset(&ds).await.unwrap();

        let events = sink.events().await;
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[2],
            SinkEvent::Point {
                xs: vec![Some(1.0)],
                ys: vec![2.0]
            }
        );
        assert_eq!(sink.end_count().await, 1);
        assert_eq!(sink.datasets().await[0].uid, ds.uid);
    }
}

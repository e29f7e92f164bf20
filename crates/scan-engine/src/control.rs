//! Cooperative cancellation and pause.
//!
//! A [`ScanControl`] is shared between the task running a scan and whoever
//! wants to stop or pause it. Requests are only honoured at breakpoints:
//!
//! | request      | honoured at                                    |
//! |--------------|------------------------------------------------|
//! | `Immediate`  | every breakpoint, and inside sleeps and count loops |
//! | `AfterPoint` | the end of the current point                   |
//! | `AfterScan`  | the end of the run                             |
//!
//! A honoured request surfaces as [`ScanError::Cancelled`] after the cleanup
//! of the interrupted phase has run.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use scan_core::{ScanError, ScanResult, StopLevel};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where a breakpoint sits in the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// After every point
    Point,
    /// After the whole run
    Run,
}

impl Checkpoint {
    fn honours(&self, level: StopLevel) -> bool {
        match self {
            Checkpoint::Point => level <= StopLevel::AfterPoint,
            Checkpoint::Run => true,
        }
    }
}

struct ControlInner {
    token: CancellationToken,
    requested: Mutex<Option<StopLevel>>,
    paused: watch::Sender<bool>,
}

/// Cloneable stop/pause handle of one scan.
#[derive(Clone)]
pub struct ScanControl {
    inner: Arc<ControlInner>,
}

impl Default for ScanControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScanControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanControl")
            .field("requested", &self.stop_requested())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl ScanControl {
    /// Fresh handle with no request pending.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                token: CancellationToken::new(),
                requested: Mutex::new(None),
                paused,
            }),
        }
    }

    /// Request a stop. The most urgent pending request wins.
    ///
    /// A stop request also releases a pause, so that a paused scan can reach
    /// its next breakpoint and unwind.
    pub fn request_stop(&self, level: StopLevel) {
        {
            let mut requested = self
                .inner
                .requested
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let merged = match *requested {
                Some(current) => current.min(level),
                None => level,
            };
            *requested = Some(merged);
        }
        info!(level = %level, "Stop requested");
        if level == StopLevel::Immediate {
            self.inner.token.cancel();
        }
        self.inner.paused.send_replace(false);
    }

    /// The pending stop request, if any.
    pub fn stop_requested(&self) -> Option<StopLevel> {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an immediate stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token cancelled on an immediate stop, for use in `select!`.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Hold the scan at its next breakpoint.
    pub fn pause(&self) {
        debug!("Pause requested");
        self.inner.paused.send_replace(true);
    }

    /// Release a pause.
    pub fn resume(&self) {
        debug!("Resume requested");
        self.inner.paused.send_replace(false);
    }

    /// Whether a pause is in effect.
    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Fail fast if an immediate stop was requested.
    pub fn check_immediate(&self) -> ScanResult<()> {
        if self.is_cancelled() {
            return Err(ScanError::Cancelled(StopLevel::Immediate));
        }
        Ok(())
    }

    /// Cooperative breakpoint: wait while paused, then honour a pending stop.
    pub async fn breakpoint(&self, checkpoint: Checkpoint) -> ScanResult<()> {
        if self.is_paused() {
            info!(?checkpoint, "Scan paused");
            let mut rx = self.inner.paused.subscribe();
            tokio::select! {
                _ = rx.wait_for(|paused| !*paused) => {}
                _ = self.inner.token.cancelled() => {}
            }
            info!("Scan resumed");
        }
        match self.stop_requested() {
            Some(level) if checkpoint.honours(level) => {
                debug!(?checkpoint, level = %level, "Honouring stop request");
                Err(ScanError::Cancelled(level))
            }
            _ => Ok(()),
        }
    }

    /// Sleep, waking early on an immediate stop.
    pub async fn sleep(&self, duration: Duration) -> ScanResult<()> {
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(ScanError::Cancelled(StopLevel::Immediate)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn point_checkpoint_ignores_after_scan() {
        let control = ScanControl::new();
        control.request_stop(StopLevel::AfterScan);
        assert!(control.breakpoint(Checkpoint::Point).await.is_ok());
        assert!(matches!(
            control.breakpoint(Checkpoint::Run).await,
            Err(ScanError::Cancelled(StopLevel::AfterScan))
        ));
    }

    #[tokio::test]
    async fn most_urgent_request_wins() {
        let control = ScanControl::new();
        control.request_stop(StopLevel::AfterScan);
        control.request_stop(StopLevel::AfterPoint);
        control.request_stop(StopLevel::AfterScan);
        assert_eq!(control.stop_requested(), Some(StopLevel::AfterPoint));
        assert!(!control.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_stop_interrupts_sleep() {
        let control = ScanControl::new();
        let remote = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.request_stop(StopLevel::Immediate);
        });
        let result = control.sleep(Duration::from_secs(3600)).await;
        assert!(matches!(
            result,
            Err(ScanError::Cancelled(StopLevel::Immediate))
        ));
        assert!(control.check_immediate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn breakpoint_waits_while_paused() {
        let control = ScanControl::new();
        control.pause();
        let remote = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            remote.resume();
        });
        let before = tokio::time::Instant::now();
        control.breakpoint(Checkpoint::Point).await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_pause() {
        let control = ScanControl::new();
        control.pause();
        let remote = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.request_stop(StopLevel::AfterPoint);
        });
        assert!(matches!(
            control.breakpoint(Checkpoint::Point).await,
            Err(ScanError::Cancelled(StopLevel::AfterPoint))
        ));
    }
}

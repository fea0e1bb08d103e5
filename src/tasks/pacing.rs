//! Anti-flood pacing and cancellation

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::PacingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Cancellation flag shared between a running task and whoever may stop it.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless cancellation comes first.
    pub async fn guard<F: std::future::Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            out = fut => Ok(out),
            _ = self.cancelled() => Err(Cancelled),
        }
    }
}

/// Inclusive randomized delay range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingWindow {
    pub min: Duration,
    pub max: Duration,
}

impl PacingWindow {
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    pub fn pick(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let ms = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceKind {
    /// Before touching an account at all.
    AntiFlood,
    /// Between accounts of a bulk run.
    BulkGap,
    /// Between mutating requests inside one workflow.
    Step,
    /// Retry backoff after a transient error.
    Backoff,
}

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub anti_flood: PacingWindow,
    pub bulk: PacingWindow,
    pub step: PacingWindow,
}

impl Pacing {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            anti_flood: PacingWindow::new(
                Duration::from_secs(config.anti_flood_min_secs),
                Duration::from_secs(config.anti_flood_max_secs),
            ),
            bulk: PacingWindow::new(
                Duration::from_secs(config.bulk_min_secs),
                Duration::from_secs(config.bulk_max_secs),
            ),
            step: PacingWindow::new(
                Duration::from_millis(config.step_min_ms),
                Duration::from_millis(config.step_max_ms),
            ),
        }
    }

    pub fn window(&self, kind: PaceKind) -> PacingWindow {
        match kind {
            PaceKind::AntiFlood => self.anti_flood,
            PaceKind::BulkGap => self.bulk,
            PaceKind::Step | PaceKind::Backoff => self.step,
        }
    }
}

#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, kind: PaceKind, delay: Duration, cancel: &CancelToken) -> Result<(), Cancelled>;
}

pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, _kind: PaceKind, delay: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        cancel.guard(tokio::time::sleep(delay)).await
    }
}

/// Records requested delays instead of sleeping.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingPacer {
    pub pauses: std::sync::Mutex<Vec<(PaceKind, Duration)>>,
    /// Cancel the running task on this pause (1-based).
    pub cancel_after: Option<usize>,
    /// Really sleep this long on every pause, letting other tasks run.
    pub hold: Option<Duration>,
}

#[cfg(test)]
impl RecordingPacer {
    pub fn recorded(&self) -> Vec<(PaceKind, Duration)> {
        self.pauses.lock().unwrap().clone()
    }

    pub fn count(&self, kind: PaceKind) -> usize {
        self.recorded().iter().filter(|(k, _)| *k == kind).count()
    }
}

#[cfg(test)]
#[async_trait]
impl Pacer for RecordingPacer {
    async fn pause(&self, kind: PaceKind, delay: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let n = {
            let mut pauses = self.pauses.lock().unwrap();
            pauses.push((kind, delay));
            pauses.len()
        };
        if self.cancel_after.is_some_and(|after| n >= after) {
            cancel.cancel();
        }
        if let Some(hold) = self.hold {
            cancel.guard(tokio::time::sleep(hold)).await?;
        }
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }
}

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    models::JobUpdate,
    runner::{ProgressEvent, ProgressSink},
    store::JobStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSettings {
    pub throttle_interval: Duration,
    // at or below this, only forced boundary reports are written
    pub quick_tool_threshold: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_secs(5),
            quick_tool_threshold: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    Interval,
    BoundariesOnly,
}

#[derive(Debug, Clone)]
pub struct Throttle {
    mode: ThrottleMode,
    interval: Duration,
    last_update: Option<Instant>,
}

impl Throttle {
    pub fn new(mode: ThrottleMode, interval: Duration) -> Self {
        Self {
            mode,
            interval,
            last_update: None,
        }
    }

    pub fn for_tool(estimated_duration_secs: u32, settings: &ProgressSettings) -> Self {
        let estimated = Duration::from_secs(u64::from(estimated_duration_secs));
        let mode = if estimated <= settings.quick_tool_threshold {
            ThrottleMode::BoundariesOnly
        } else {
            ThrottleMode::Interval
        };
        Self::new(mode, settings.throttle_interval)
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_update = Some(now);
    }

    pub fn admit(&mut self, now: Instant, force: bool) -> bool {
        let admitted = force
            || match self.mode {
                ThrottleMode::BoundariesOnly => false,
                ThrottleMode::Interval => self
                    .last_update
                    .map_or(true, |last| now.saturating_duration_since(last) >= self.interval),
            };
        if admitted {
            self.last_update = Some(now);
        }
        admitted
    }
}

pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    throttle: Throttle,
    last_percent: u8,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: Uuid, throttle: Throttle) -> Self {
        Self {
            store,
            job_id,
            throttle,
            last_percent: 0,
        }
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    /// Store failures are logged, never propagated.
    pub async fn apply(&mut self, percent: u8, step: &str, force: bool) -> bool {
        let percent = percent.min(100).max(self.last_percent);
        if !self.throttle.admit(Instant::now(), force) {
            return false;
        }

        match self
            .store
            .update(self.job_id, JobUpdate::progress(percent, step))
            .await
        {
            Ok(()) => {
                debug!(job_id = %self.job_id, percent, step, "progress persisted");
                self.last_percent = percent;
                true
            }
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "failed to persist progress");
                false
            }
        }
    }
}

pub struct BlockingProgress<'a> {
    handle: Handle,
    reporter: &'a mut ProgressReporter,
}

impl<'a> BlockingProgress<'a> {
    /// `handle` must belong to a runtime the current thread is not driving.
    pub fn new(handle: Handle, reporter: &'a mut ProgressReporter) -> Self {
        Self { handle, reporter }
    }
}

impl ProgressSink for BlockingProgress<'_> {
    fn report(&mut self, event: ProgressEvent) {
        self.handle
            .block_on(self.reporter.apply(event.percent, &event.step, event.force));
    }
}

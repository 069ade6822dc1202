use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info};
use uuid::Uuid;

use crate::{error::StoreError, models::ScanJob, orchestrator::Orchestrator, store::JobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: Uuid,
}

#[derive(Debug, Default)]
pub struct JobRunnerState {
    pub running: usize,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit_per_minute: usize,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: usize) -> Self {
        Self {
            limit_per_minute,
            requests: VecDeque::new(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.requests.front() {
            if now.saturating_duration_since(*front) >= Duration::from_secs(60) {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.requests.len() >= self.limit_per_minute {
            return false;
        }
        self.requests.push_back(now);
        true
    }
}

pub async fn worker_loop(
    orchestrator: Orchestrator,
    mut rx: mpsc::Receiver<QueuedJob>,
    runner_state: Arc<Mutex<JobRunnerState>>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        runner_state.lock().await.running += 1;

        let orchestrator = orchestrator.clone();
        let runner_state = runner_state.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match orchestrator.start_job(job.id).await {
                Ok(outcome) => info!(
                    job_id = %job.id,
                    findings = outcome.summary.total_findings,
                    "scan completed"
                ),
                Err(e) => error!(error = %e, job_id = %job.id, "scan failed"),
            }
            decrement_running(&runner_state).await;
        });
    }

    info!("job queue closed, worker loop exiting");
}

async fn decrement_running(runner_state: &Arc<Mutex<JobRunnerState>>) {
    let mut lock = runner_state.lock().await;
    lock.running = lock.running.saturating_sub(1);
}

#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Finished(ScanJob),
    StillRunning(ScanJob),
}

/// Polls until the job is terminal or `timeout` elapses.
pub async fn wait_for_completion(
    store: &dyn JobStore,
    job_id: Uuid,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<WaitOutcome, StoreError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(WaitOutcome::Finished(job));
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::StillRunning(job));
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

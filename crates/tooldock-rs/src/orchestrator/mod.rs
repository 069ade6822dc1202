use std::{sync::Arc, time::Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::{runtime::Handle, task};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::EngineError,
    models::{JobStatus, JobUpdate, NewFinding, ScanJob, SeveritySummary, Tool},
    parser,
    progress::{BlockingProgress, ProgressReporter, ProgressSettings, Throttle},
    runner::{RunnerRegistry, ScanOptions},
    store::JobStore,
};

const MAX_REASON_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub findings: Vec<NewFinding>,
    pub summary: SeveritySummary,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<RunnerRegistry>,
    progress: ProgressSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RunnerRegistry>,
        progress: ProgressSettings,
    ) -> Self {
        Self {
            store,
            registry,
            progress,
        }
    }

    pub async fn start_job(&self, job_id: Uuid) -> Result<JobOutcome, EngineError> {
        let job = self.store.get(job_id).await?;
        if !job.consent {
            return Err(EngineError::ConsentRequired(job_id));
        }
        let next = job.status.transition(JobStatus::Running)?;
        let tool = self.store.get_tool(&job.tool).await?;

        self.store
            .update(
                job_id,
                JobUpdate {
                    status: Some(next),
                    started_at: Some(Utc::now()),
                    ..JobUpdate::progress(0, "Starting")
                },
            )
            .await?;
        info!(job_id = %job_id, tool = %job.tool, target = %job.target, "job started");

        match self.execute(&job, tool.as_ref()).await {
            Ok(outcome) => {
                info!(
                    job_id = %job_id,
                    findings = outcome.summary.total_findings,
                    critical = outcome.summary.critical,
                    high = outcome.summary.high,
                    "job completed"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.fail(job_id, &err).await;
                Err(err)
            }
        }
    }

    async fn execute(&self, job: &ScanJob, tool: Option<&Tool>) -> Result<JobOutcome, EngineError> {
        // Output format follows the runner, so parsers share its registry key.
        let runner_name = tool.map_or(job.tool.as_str(), |t| t.runner.as_str());
        let runner = self.registry.resolve(runner_name)?;
        let options = ScanOptions::from_value(&job.options);

        let mut throttle =
            Throttle::for_tool(tool.map_or(0, |t| t.estimated_duration), &self.progress);
        // the running transition above carried the 0% report
        throttle.mark(Instant::now());
        let mut reporter = ProgressReporter::new(self.store.clone(), job.id, throttle);

        let handle = Handle::current();
        let target = job.target.clone();
        let raw_output = task::spawn_blocking(move || {
            let mut sink = BlockingProgress::new(handle, &mut reporter);
            runner.run(&target, &options, &mut sink)
        })
        .await
        .map_err(|e| EngineError::WorkerPanicked(e.to_string()))??;

        let parse_input = raw_output.clone();
        let parser_name = runner_name.to_string();
        let findings = task::spawn_blocking(move || parser::parse(&parse_input, &parser_name))
            .await
            .map_err(|e| EngineError::WorkerPanicked(e.to_string()))?;

        let next = JobStatus::Running.transition(JobStatus::Completed)?;
        self.store
            .complete_job(
                job.id,
                &findings,
                JobUpdate {
                    status: Some(next),
                    completed_at: Some(Utc::now()),
                    raw_output: Some(raw_output),
                    ..JobUpdate::progress(100, "Completed")
                },
            )
            .await?;

        Ok(JobOutcome {
            job_id: job.id,
            summary: SeveritySummary::from_findings(&findings),
            findings,
        })
    }

    async fn fail(&self, job_id: Uuid, err: &EngineError) {
        let reason: String = format!("Failed: {err}")
            .chars()
            .take(MAX_REASON_CHARS)
            .collect();
        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            completed_at: Some(Utc::now()),
            current_step: Some(reason),
            ..JobUpdate::default()
        };
        match self.store.update(job_id, update).await {
            Ok(()) => info!(job_id = %job_id, "job marked failed"),
            Err(store_err) => {
                error!(job_id = %job_id, error = %store_err, "could not persist job failure")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        error::RunnerError,
        models::Severity,
        runner::{ProgressEvent, ProgressSink, Runner},
        store::testing::{new_job, RecordingStore},
    };

    #[derive(Clone)]
    struct FakeRunner {
        output: String,
        events: Vec<ProgressEvent>,
    }

    impl Runner for FakeRunner {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn run(
            &self,
            _target: &str,
            _options: &ScanOptions,
            progress: &mut dyn ProgressSink,
        ) -> Result<String, RunnerError> {
            for event in &self.events {
                progress.report(event.clone());
            }
            Ok(self.output.clone())
        }
    }

    struct FailingRunner;

    impl Runner for FailingRunner {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(
            &self,
            _target: &str,
            _options: &ScanOptions,
            progress: &mut dyn ProgressSink,
        ) -> Result<String, RunnerError> {
            progress.report(ProgressEvent::new(30, "Port scanning - 30% complete"));
            Err(RunnerError::ExecutionFailed {
                exit_code: Some(1),
                stderr: "Failed to resolve \"nope\".".into(),
            })
        }
    }

    struct PanickingRunner;

    impl Runner for PanickingRunner {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn run(
            &self,
            _target: &str,
            _options: &ScanOptions,
            _progress: &mut dyn ProgressSink,
        ) -> Result<String, RunnerError> {
            panic!("adapter bug");
        }
    }

    fn unthrottled() -> ProgressSettings {
        ProgressSettings {
            throttle_interval: Duration::ZERO,
            quick_tool_threshold: Duration::ZERO,
        }
    }

    fn fake(output: &str, events: Vec<ProgressEvent>) -> Arc<RunnerRegistry> {
        let runner = FakeRunner {
            output: output.to_string(),
            events,
        };
        Arc::new(
            RunnerRegistry::builder()
                .register("nmap", move || runner.clone())
                .build(),
        )
    }

    async fn queued_job(store: &RecordingStore) -> Uuid {
        store
            .create_job(new_job("10.0.0.1", json!({"scan_type": "default"})))
            .await
            .unwrap()
            .id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn successful_run_completes_with_findings() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let xml = include_str!("../../fixtures/nmap_vulners.xml");
        let registry = fake(
            xml,
            vec![
                ProgressEvent::new(10, "Host discovery"),
                ProgressEvent::new(5, "Entering phase: Service detection"),
                ProgressEvent::new(60, "Service detection - 60% complete"),
                ProgressEvent::forced(100, "Scan completed"),
            ],
        );
        let orchestrator = Orchestrator::new(store.clone(), registry, unthrottled());

        let outcome = orchestrator.start_job(job_id).await.unwrap();
        assert_eq!(outcome.findings.len(), 3);
        assert_eq!(outcome.summary.critical, 1);
        assert_eq!(outcome.summary.high, 1);
        assert_eq!(outcome.summary.info, 1);

        assert_eq!(store.statuses(), [JobStatus::Running, JobStatus::Completed]);
        let samples = store.progress_samples();
        assert_eq!(samples, [0, 10, 10, 60, 100, 100]);
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.current_step, "Completed");
        assert_eq!(job.raw_output.as_deref(), Some(xml));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());

        let stored = store.list_findings(job_id).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].fields, outcome.findings[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_finding_fails_the_job_without_partial_findings() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        store.reject_finding_at(1);
        let registry = fake(include_str!("../../fixtures/nmap_vulners.xml"), Vec::new());
        let orchestrator = Orchestrator::new(store.clone(), registry, unthrottled());

        let err = orchestrator.start_job(job_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));

        assert_eq!(store.statuses(), [JobStatus::Running, JobStatus::Failed]);
        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.raw_output.is_none());
        assert!(job.current_step.starts_with("Failed:"));
        assert!(store.list_findings(job_id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_tool_progress_is_throttled_but_boundaries_persist() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let registry = fake(
            include_str!("../../fixtures/nmap_ssh.xml"),
            vec![
                ProgressEvent::new(20, "Port scanning - 20% complete"),
                ProgressEvent::new(40, "Port scanning - 40% complete"),
                ProgressEvent::forced(100, "Scan completed"),
            ],
        );
        let orchestrator = Orchestrator::new(store.clone(), registry, ProgressSettings::default());

        orchestrator.start_job(job_id).await.unwrap();
        assert_eq!(store.progress_samples(), [0, 100, 100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runner_failure_is_persisted_then_returned() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let registry = Arc::new(
            RunnerRegistry::builder()
                .register("nmap", || FailingRunner)
                .build(),
        );
        let orchestrator = Orchestrator::new(store.clone(), registry, unthrottled());

        let err = orchestrator.start_job(job_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::RunnerExecutionFailed(RunnerError::ExecutionFailed {
                exit_code: Some(1),
                ..
            })
        ));

        assert_eq!(store.statuses(), [JobStatus::Running, JobStatus::Failed]);
        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert!(job.raw_output.is_none());
        assert!(job.current_step.starts_with("Failed:"));
        assert!(job.current_step.contains("nope"));
        assert_eq!(job.progress, 30);
        assert!(store.list_findings(job_id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregistered_tool_fails_the_job() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(RunnerRegistry::builder().build()),
            unthrottled(),
        );

        let err = orchestrator.start_job(job_id).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolNotRegistered(ref name) if name == "nmap"));
        assert_eq!(store.statuses(), [JobStatus::Running, JobStatus::Failed]);
        assert_eq!(store.get(job_id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_runner_fails_the_job() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let registry = Arc::new(
            RunnerRegistry::builder()
                .register("nmap", || PanickingRunner)
                .build(),
        );
        let orchestrator = Orchestrator::new(store.clone(), registry, unthrottled());

        let err = orchestrator.start_job(job_id).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerPanicked(_)));
        assert_eq!(store.get(job_id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unparseable_output_still_completes() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let orchestrator = Orchestrator::new(
            store.clone(),
            fake("<nmaprun><host><address", Vec::new()),
            unthrottled(),
        );

        let outcome = orchestrator.start_job(job_id).await.unwrap();
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].severity, Severity::Critical);
        assert_eq!(store.statuses(), [JobStatus::Running, JobStatus::Completed]);
        assert_eq!(store.get(job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_or_unconsented_jobs_are_left_untouched() {
        let store = RecordingStore::new().await;
        let orchestrator = Orchestrator::new(store.clone(), fake("", Vec::new()), unthrottled());

        let missing = Uuid::new_v4();
        assert!(matches!(
            orchestrator.start_job(missing).await,
            Err(EngineError::JobNotFound(id)) if id == missing
        ));

        let mut job = new_job("10.0.0.1", json!({}));
        job.consent = false;
        let job = store.create_job(job).await.unwrap();
        assert!(matches!(
            orchestrator.start_job(job.id).await,
            Err(EngineError::ConsentRequired(_))
        ));

        assert!(store.updates().is_empty());
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_jobs_cannot_be_restarted() {
        let store = RecordingStore::new().await;
        let job_id = queued_job(&store).await;
        let orchestrator = Orchestrator::new(
            store.clone(),
            fake(include_str!("../../fixtures/nmap_ssh.xml"), Vec::new()),
            unthrottled(),
        );

        orchestrator.start_job(job_id).await.unwrap();
        let before = store.updates().len();

        let err = orchestrator.start_job(job_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Running
            }
        ));
        assert_eq!(store.updates().len(), before);
        assert_eq!(store.list_findings(job_id).await.unwrap().len(), 1);
    }
}

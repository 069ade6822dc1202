use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{create_pool, run_migrations, JobStore, SqliteJobStore};
use crate::{
    error::StoreError,
    models::{
        CategorySummary, Finding, JobUpdate, NewFinding, NewScanJob, ScanJob, Tool, ToolCategory,
    },
};

pub async fn memory_store() -> SqliteJobStore {
    let pool = create_pool("sqlite::memory:").await.expect("memory pool");
    run_migrations(&pool).await.expect("migrations");
    let store = SqliteJobStore::new(pool);
    store.upsert_tool(&nmap_tool(120)).await.expect("seed tool");
    store
}

pub fn nmap_tool(estimated_duration: u32) -> Tool {
    Tool {
        name: "nmap".into(),
        display_name: "Nmap".into(),
        category: "network_scanning".into(),
        requires_consent: true,
        supported_input_types: ["ip", "ip_range", "domain", "url"]
            .into_iter()
            .map(String::from)
            .collect(),
        estimated_duration,
        runner: "nmap".into(),
        ..Tool::default()
    }
}

pub fn new_job(target: &str, options: serde_json::Value) -> NewScanJob {
    NewScanJob {
        tool: "nmap".into(),
        target: target.into(),
        input_type: "ip".into(),
        options,
        consent: true,
    }
}

pub struct RecordingStore {
    pub inner: SqliteJobStore,
    pub updates: Mutex<Vec<JobUpdate>>,
    out_of_range_finding: Mutex<Option<usize>>,
}

impl RecordingStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: memory_store().await,
            updates: Mutex::new(Vec::new()),
            out_of_range_finding: Mutex::new(None),
        })
    }

    /// The finding at `index` of the next completion gets a CVSS score the
    /// schema rejects.
    pub fn reject_finding_at(&self, index: usize) {
        *self.out_of_range_finding.lock().expect("finding lock") = Some(index);
    }

    fn record(&self, update: JobUpdate) {
        self.updates.lock().expect("updates lock").push(update);
    }

    pub fn updates(&self) -> Vec<JobUpdate> {
        self.updates.lock().expect("updates lock").clone()
    }

    pub fn progress_samples(&self) -> Vec<u8> {
        self.updates().iter().filter_map(|u| u.progress).collect()
    }

    pub fn statuses(&self) -> Vec<crate::models::JobStatus> {
        self.updates().iter().filter_map(|u| u.status).collect()
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn create_job(&self, job: NewScanJob) -> Result<ScanJob, StoreError> {
        self.inner.create_job(job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<ScanJob, StoreError> {
        self.inner.get(job_id).await
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<(), StoreError> {
        self.inner.update(job_id, update.clone()).await?;
        self.record(update);
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        findings: &[NewFinding],
        update: JobUpdate,
    ) -> Result<(), StoreError> {
        let mut findings = findings.to_vec();
        if let Some(index) = self.out_of_range_finding.lock().expect("finding lock").take() {
            if let Some(finding) = findings.get_mut(index) {
                finding.cvss_score = 11.0;
            }
        }
        self.inner
            .complete_job(job_id, &findings, update.clone())
            .await?;
        self.record(update);
        Ok(())
    }

    async fn create_finding(&self, job_id: Uuid, finding: &NewFinding) -> Result<i64, StoreError> {
        self.inner.create_finding(job_id, finding).await
    }

    async fn list_findings(&self, job_id: Uuid) -> Result<Vec<Finding>, StoreError> {
        self.inner.list_findings(job_id).await
    }

    async fn upsert_tool(&self, tool: &Tool) -> Result<(), StoreError> {
        self.inner.upsert_tool(tool).await
    }

    async fn get_tool(&self, name: &str) -> Result<Option<Tool>, StoreError> {
        self.inner.get_tool(name).await
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError> {
        self.inner.list_tools().await
    }

    async fn upsert_category(&self, category: &ToolCategory) -> Result<(), StoreError> {
        self.inner.upsert_category(category).await
    }

    async fn list_categories(&self) -> Result<Vec<CategorySummary>, StoreError> {
        self.inner.list_categories().await
    }
}

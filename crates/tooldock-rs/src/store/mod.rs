use std::{collections::BTreeSet, str::FromStr};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        CategorySummary, Finding, JobStatus, JobUpdate, NewFinding, NewScanJob, ScanJob, Severity,
        Tool, ToolCategory,
    },
};

#[cfg(test)]
pub(crate) mod testing;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // every connection to `:memory:` is its own database
    let max_connections = if url.contains(":memory:") { 1 } else { 8 };
    Ok(SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Every call is atomic: either all of its writes land or none do.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewScanJob) -> Result<ScanJob, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<ScanJob, StoreError>;

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<(), StoreError>;

    async fn create_finding(&self, job_id: Uuid, finding: &NewFinding) -> Result<i64, StoreError>;

    /// Attaches `findings` and applies the terminal `update` together.
    async fn complete_job(
        &self,
        job_id: Uuid,
        findings: &[NewFinding],
        update: JobUpdate,
    ) -> Result<(), StoreError>;

    async fn list_findings(&self, job_id: Uuid) -> Result<Vec<Finding>, StoreError>;

    async fn upsert_tool(&self, tool: &Tool) -> Result<(), StoreError>;

    async fn get_tool(&self, name: &str) -> Result<Option<Tool>, StoreError>;

    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError>;

    async fn upsert_category(&self, category: &ToolCategory) -> Result<(), StoreError>;

    async fn list_categories(&self) -> Result<Vec<CategorySummary>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const JOB_COLUMNS: &str = "id, tool, target, input_type, options, consent, status, progress, \
     current_step, created_at, started_at, completed_at, raw_output";

const FINDING_COLUMNS: &str = "id, job_id, severity, title, description, category, cvss_score, \
     cve_ids, port, protocol, service, version, remediation, reference_urls, affected_component";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: NewScanJob) -> Result<ScanJob, StoreError> {
        let record = ScanJob {
            id: Uuid::new_v4(),
            tool: job.tool,
            target: job.target,
            input_type: job.input_type,
            options: job.options,
            consent: job.consent,
            status: JobStatus::Queued,
            progress: 0,
            current_step: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            raw_output: None,
        };

        sqlx::query(
            "INSERT INTO scan_jobs(id, tool, target, input_type, options, consent, status, progress, current_step, created_at) \
             VALUES(?, ?, ?, ?, ?, ?, ?, 0, '', ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.tool)
        .bind(&record.target)
        .bind(&record.input_type)
        .bind(record.options.to_string())
        .bind(record.consent)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, job_id: Uuid) -> Result<ScanJob, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        job_from_row(&row)
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        apply_update(&mut conn, job_id, update).await
    }

    async fn create_finding(&self, job_id: Uuid, finding: &NewFinding) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_finding(&mut conn, job_id, finding).await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        findings: &[NewFinding],
        update: JobUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for finding in findings {
            insert_finding(&mut tx, job_id, finding).await?;
        }
        apply_update(&mut tx, job_id, update).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_findings(&self, job_id: Uuid) -> Result<Vec<Finding>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FINDING_COLUMNS} FROM findings WHERE job_id = ? ORDER BY id"
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(finding_from_row).collect()
    }

    async fn upsert_tool(&self, tool: &Tool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tools(name, display_name, category, description, long_description, icon, requires_consent, input_schema, supported_input_types, estimated_duration, difficulty, runner) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                display_name = excluded.display_name, \
                category = excluded.category, \
                description = excluded.description, \
                long_description = excluded.long_description, \
                icon = excluded.icon, \
                requires_consent = excluded.requires_consent, \
                input_schema = excluded.input_schema, \
                supported_input_types = excluded.supported_input_types, \
                estimated_duration = excluded.estimated_duration, \
                difficulty = excluded.difficulty, \
                runner = excluded.runner",
        )
        .bind(&tool.name)
        .bind(&tool.display_name)
        .bind(&tool.category)
        .bind(&tool.description)
        .bind(&tool.long_description)
        .bind(&tool.icon)
        .bind(tool.requires_consent)
        .bind(tool.input_schema.to_string())
        .bind(to_json(&tool.supported_input_types)?)
        .bind(i64::from(tool.estimated_duration))
        .bind(&tool.difficulty)
        .bind(&tool.runner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tool(&self, name: &str) -> Result<Option<Tool>, StoreError> {
        let row = sqlx::query("SELECT * FROM tools WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tool_from_row).transpose()
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tools ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tool_from_row).collect()
    }

    async fn upsert_category(&self, category: &ToolCategory) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tool_categories(id, name, description, icon) VALUES(?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                name = excluded.name, \
                description = excluded.description, \
                icon = excluded.icon",
        )
        .bind(&category.id)
        .bind(&category.name)
        .bind(&category.description)
        .bind(&category.icon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<CategorySummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.description, c.icon, COUNT(t.name) AS tool_count \
             FROM tool_categories c LEFT JOIN tools t ON t.category = c.id \
             GROUP BY c.id ORDER BY c.name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(category_from_row).collect()
    }
}

async fn apply_update(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    update: JobUpdate,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE scan_jobs SET \
            status = COALESCE(?, status), \
            progress = COALESCE(?, progress), \
            current_step = COALESCE(?, current_step), \
            started_at = COALESCE(?, started_at), \
            completed_at = COALESCE(?, completed_at), \
            raw_output = COALESCE(?, raw_output) \
         WHERE id = ?",
    )
    .bind(update.status.map(JobStatus::as_str))
    .bind(update.progress.map(i64::from))
    .bind(update.current_step)
    .bind(update.started_at)
    .bind(update.completed_at)
    .bind(update.raw_output)
    .bind(job_id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::JobNotFound(job_id));
    }
    Ok(())
}

async fn insert_finding(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    finding: &NewFinding,
) -> Result<i64, StoreError> {
    let inserted = sqlx::query(
        "INSERT INTO findings(job_id, severity, title, description, category, cvss_score, cve_ids, port, protocol, service, version, remediation, reference_urls, affected_component) \
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(job_id.to_string())
    .bind(finding.severity.as_str())
    .bind(&finding.title)
    .bind(&finding.description)
    .bind(&finding.category)
    .bind(finding.cvss_score)
    .bind(to_json(&finding.cve_ids)?)
    .bind(finding.port.map(i64::from))
    .bind(&finding.protocol)
    .bind(&finding.service)
    .bind(&finding.version)
    .bind(&finding.remediation)
    .bind(to_json(&finding.references)?)
    .bind(&finding.affected_component)
    .execute(&mut *conn)
    .await?;

    Ok(inserted.last_insert_rowid())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("id {raw}: {e}")))
}

fn job_from_row(row: &SqliteRow) -> Result<ScanJob, StoreError> {
    let id: String = row.try_get("id")?;
    let options: String = row.try_get("options")?;
    let status: String = row.try_get("status")?;
    let progress: i64 = row.try_get("progress")?;

    Ok(ScanJob {
        id: parse_uuid(&id)?,
        tool: row.try_get("tool")?,
        target: row.try_get("target")?,
        input_type: row.try_get("input_type")?,
        options: from_json(&options, "options")?,
        consent: row.try_get("consent")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        progress: progress.clamp(0, 100) as u8,
        current_step: row.try_get("current_step")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        raw_output: row.try_get("raw_output")?,
    })
}

fn finding_from_row(row: &SqliteRow) -> Result<Finding, StoreError> {
    let job_id: String = row.try_get("job_id")?;
    let severity: String = row.try_get("severity")?;
    let cve_ids: String = row.try_get("cve_ids")?;
    let references: String = row.try_get("reference_urls")?;
    let port: Option<i64> = row.try_get("port")?;

    Ok(Finding {
        id: row.try_get("id")?,
        job_id: parse_uuid(&job_id)?,
        fields: NewFinding {
            severity: Severity::from_str(&severity).map_err(StoreError::Corrupt)?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            category: row.try_get("category")?,
            cvss_score: row.try_get("cvss_score")?,
            cve_ids: from_json::<BTreeSet<String>>(&cve_ids, "cve_ids")?,
            port: port.and_then(|p| u16::try_from(p).ok()),
            protocol: row.try_get("protocol")?,
            service: row.try_get("service")?,
            version: row.try_get("version")?,
            remediation: row.try_get("remediation")?,
            references: from_json(&references, "reference_urls")?,
            affected_component: row.try_get("affected_component")?,
        },
    })
}

fn tool_from_row(row: &SqliteRow) -> Result<Tool, StoreError> {
    let input_schema: String = row.try_get("input_schema")?;
    let input_types: String = row.try_get("supported_input_types")?;
    let estimated: i64 = row.try_get("estimated_duration")?;

    Ok(Tool {
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        long_description: row.try_get("long_description")?,
        icon: row.try_get("icon")?,
        requires_consent: row.try_get("requires_consent")?,
        input_schema: from_json(&input_schema, "input_schema")?,
        supported_input_types: from_json(&input_types, "supported_input_types")?,
        estimated_duration: u32::try_from(estimated).unwrap_or_default(),
        difficulty: row.try_get("difficulty")?,
        runner: row.try_get("runner")?,
    })
}

fn category_from_row(row: &SqliteRow) -> Result<CategorySummary, StoreError> {
    let tool_count: i64 = row.try_get("tool_count")?;

    Ok(CategorySummary {
        category: ToolCategory {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            icon: row.try_get("icon")?,
        },
        tool_count: usize::try_from(tool_count).unwrap_or_default(),
    })
}

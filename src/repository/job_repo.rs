// ==========================================
// 数据迁移导入引擎 - 导入作业仓储
// ==========================================
// 职责: import_job / job_mapping / job_value_map / transformation_rule 表的 CRUD
// 红线: Repository 不含业务逻辑（状态转换合法性由 engine::job_state 负责）
// ==========================================

use crate::domain::job::{ImportJob, JobCounts, JobOptions};
use crate::domain::mapping::{AnalysisResult, FieldMapping, TemplateRef, ValueMap};
use crate::domain::rule::TransformationRule;
use crate::domain::types::JobState;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

// 原始行（JSON 列解析放在锁外完成）
struct JobRow {
    job_id: String,
    tenant_id: String,
    source_system: String,
    target_entity_type: String,
    state: String,
    options_json: String,
    counts_json: String,
    blob_key: Option<String>,
    encoding_hint: Option<String>,
    analysis_json: Option<String>,
    template_id: Option<String>,
    template_version: Option<i64>,
    failure_reason: Option<String>,
    last_committed_batch: Option<i64>,
    created_at: String,
    updated_at: String,
}

const JOB_COLUMNS: &str = r#"
    job_id, tenant_id, source_system, target_entity_type, state,
    options_json, counts_json, blob_key, encoding_hint, analysis_json,
    template_id, template_version, failure_reason, last_committed_batch,
    created_at, updated_at
"#;

fn read_job_row(row: &Row) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        tenant_id: row.get(1)?,
        source_system: row.get(2)?,
        target_entity_type: row.get(3)?,
        state: row.get(4)?,
        options_json: row.get(5)?,
        counts_json: row.get(6)?,
        blob_key: row.get(7)?,
        encoding_hint: row.get(8)?,
        analysis_json: row.get(9)?,
        template_id: row.get(10)?,
        template_version: row.get(11)?,
        failure_reason: row.get(12)?,
        last_committed_batch: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl JobRow {
    fn into_job(self) -> RepositoryResult<ImportJob> {
        let state = JobState::parse(&self.state).ok_or_else(|| {
            RepositoryError::SerializationError(format!("未知作业状态: {}", self.state))
        })?;
        let options: JobOptions = serde_json::from_str(&self.options_json)?;
        let counts: JobCounts = serde_json::from_str(&self.counts_json)?;
        let analysis: Option<AnalysisResult> = match self.analysis_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        let template = match (self.template_id, self.template_version) {
            (Some(template_id), Some(version)) => Some(TemplateRef {
                template_id,
                version,
            }),
            _ => None,
        };

        Ok(ImportJob {
            job_id: self.job_id,
            tenant_id: self.tenant_id,
            source_system: self.source_system,
            target_entity_type: self.target_entity_type,
            state,
            options,
            counts,
            blob_key: self.blob_key,
            encoding_hint: self.encoding_hint,
            analysis,
            template,
            failure_reason: self.failure_reason,
            last_committed_batch: self.last_committed_batch.map(|v| v as usize),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// 已挂接的转换规则
#[derive(Debug, Clone)]
pub struct StoredRule {
    pub rule_id: String,
    pub job_id: String,
    pub target_field: String,
    pub rule: TransformationRule,
}

// ==========================================
// ImportJobRepository
// ==========================================
pub struct ImportJobRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ImportJobRepository {
    /// 从共享连接创建仓储（确保表结构存在）
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let repo = Self { conn };
        repo.ensure_tables()?;
        Ok(repo)
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn ensure_tables(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS import_job (
              job_id TEXT PRIMARY KEY,
              tenant_id TEXT NOT NULL,
              source_system TEXT NOT NULL,
              target_entity_type TEXT NOT NULL,
              state TEXT NOT NULL,
              options_json TEXT NOT NULL,
              counts_json TEXT NOT NULL,
              blob_key TEXT,
              encoding_hint TEXT,
              analysis_json TEXT,
              template_id TEXT,
              template_version INTEGER,
              failure_reason TEXT,
              last_committed_batch INTEGER,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_import_job_tenant ON import_job(tenant_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS job_mapping (
              job_id TEXT PRIMARY KEY REFERENCES import_job(job_id),
              mapping_json TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_value_map (
              job_id TEXT NOT NULL REFERENCES import_job(job_id),
              target_field TEXT NOT NULL,
              map_json TEXT NOT NULL,
              confirmed INTEGER NOT NULL DEFAULT 0,
              updated_at TEXT NOT NULL,
              PRIMARY KEY (job_id, target_field)
            );

            CREATE TABLE IF NOT EXISTS transformation_rule (
              rule_id TEXT PRIMARY KEY,
              job_id TEXT NOT NULL REFERENCES import_job(job_id),
              target_field TEXT NOT NULL,
              rule_json TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transformation_rule_job ON transformation_rule(job_id);
            "#,
        )?;
        Ok(())
    }

    // ===== import_job =====

    /// 新建作业
    pub fn insert(&self, job: &ImportJob) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO import_job ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                JOB_COLUMNS
            ),
            params![
                job.job_id,
                job.tenant_id,
                job.source_system,
                job.target_entity_type,
                job.state.as_str(),
                serde_json::to_string(&job.options)?,
                serde_json::to_string(&job.counts)?,
                job.blob_key,
                job.encoding_hint,
                job.analysis.as_ref().map(serde_json::to_string).transpose()?,
                job.template.as_ref().map(|t| t.template_id.clone()),
                job.template.as_ref().map(|t| t.version),
                job.failure_reason,
                job.last_committed_batch.map(|v| v as i64),
                format_timestamp(job.created_at),
                format_timestamp(job.updated_at),
            ],
        )?;
        Ok(())
    }

    /// 整行更新（状态以外的字段）
    pub fn update(&self, job: &ImportJob) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE import_job SET
              state = ?2, options_json = ?3, counts_json = ?4, blob_key = ?5,
              encoding_hint = ?6, analysis_json = ?7, template_id = ?8,
              template_version = ?9, failure_reason = ?10, last_committed_batch = ?11,
              updated_at = ?12
            WHERE job_id = ?1
            "#,
            params![
                job.job_id,
                job.state.as_str(),
                serde_json::to_string(&job.options)?,
                serde_json::to_string(&job.counts)?,
                job.blob_key,
                job.encoding_hint,
                job.analysis.as_ref().map(serde_json::to_string).transpose()?,
                job.template.as_ref().map(|t| t.template_id.clone()),
                job.template.as_ref().map(|t| t.version),
                job.failure_reason,
                job.last_committed_batch.map(|v| v as i64),
                format_timestamp(job.updated_at),
            ],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "ImportJob".to_string(),
                id: job.job_id.clone(),
            });
        }
        Ok(())
    }

    /// 比较并更新状态（from 不匹配时返回 false）
    pub fn compare_and_set_state(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE import_job
            SET state = ?3, failure_reason = COALESCE(?4, failure_reason), updated_at = ?5
            WHERE job_id = ?1 AND state = ?2
            "#,
            params![
                job_id,
                from.as_str(),
                to.as_str(),
                failure_reason,
                format_timestamp(now)
            ],
        )?;
        Ok(affected == 1)
    }

    /// 更新计数与游标
    pub fn update_progress(
        &self,
        job_id: &str,
        counts: &JobCounts,
        last_committed_batch: Option<usize>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_job SET counts_json = ?2, last_committed_batch = ?3, updated_at = ?4 WHERE job_id = ?1",
            params![
                job_id,
                serde_json::to_string(counts)?,
                last_committed_batch.map(|v| v as i64),
                format_timestamp(now)
            ],
        )?;
        Ok(())
    }

    /// 按 ID 查询
    pub fn find_by_id(&self, job_id: &str) -> RepositoryResult<Option<ImportJob>> {
        let raw = {
            let conn = self.get_conn()?;
            conn.query_row(
                &format!("SELECT {} FROM import_job WHERE job_id = ?1", JOB_COLUMNS),
                params![job_id],
                read_job_row,
            )
            .optional()?
        };
        raw.map(JobRow::into_job).transpose()
    }

    /// 按 ID 查询（不存在时返回 NotFound）
    pub fn get(&self, job_id: &str) -> RepositoryResult<ImportJob> {
        self.find_by_id(job_id)?.ok_or_else(|| RepositoryError::NotFound {
            entity: "ImportJob".to_string(),
            id: job_id.to_string(),
        })
    }

    /// 租户作业列表（按创建时间倒序）
    pub fn list_by_tenant(&self, tenant_id: &str) -> RepositoryResult<Vec<ImportJob>> {
        let rows = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM import_job WHERE tenant_id = ?1 ORDER BY created_at DESC, job_id",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![tenant_id], read_job_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(JobRow::into_job).collect()
    }

    // ===== job_mapping =====

    pub fn save_mapping(
        &self,
        job_id: &str,
        mapping: &FieldMapping,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO job_mapping (job_id, mapping_json, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(job_id) DO UPDATE SET mapping_json = ?2, updated_at = ?3
            "#,
            params![job_id, serde_json::to_string(mapping)?, format_timestamp(now)],
        )?;
        Ok(())
    }

    pub fn find_mapping(&self, job_id: &str) -> RepositoryResult<Option<FieldMapping>> {
        let raw: Option<String> = {
            let conn = self.get_conn()?;
            conn.query_row(
                "SELECT mapping_json FROM job_mapping WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
        };
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ===== job_value_map =====

    pub fn save_value_map(
        &self,
        job_id: &str,
        map: &ValueMap,
        confirmed: bool,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO job_value_map (job_id, target_field, map_json, confirmed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(job_id, target_field) DO UPDATE SET map_json = ?3, confirmed = ?4, updated_at = ?5
            "#,
            params![
                job_id,
                map.target_field,
                serde_json::to_string(map)?,
                confirmed as i32,
                format_timestamp(now)
            ],
        )?;
        Ok(())
    }

    /// 作业的全部值映射（按字段名排序）
    pub fn list_value_maps(&self, job_id: &str) -> RepositoryResult<Vec<ValueMap>> {
        let rows: Vec<String> = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                "SELECT map_json FROM job_value_map WHERE job_id = ?1 ORDER BY target_field",
            )?;
            let rows = stmt
                .query_map(params![job_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            rows
        };
        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(RepositoryError::from))
            .collect()
    }

    /// 值映射是否已被用户确认
    pub fn is_value_map_confirmed(&self, job_id: &str, target_field: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let confirmed: Option<i32> = conn
            .query_row(
                "SELECT confirmed FROM job_value_map WHERE job_id = ?1 AND target_field = ?2",
                params![job_id, target_field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(confirmed.unwrap_or(0) != 0)
    }

    // ===== transformation_rule =====

    pub fn insert_rule(&self, stored: &StoredRule, now: DateTime<Utc>) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO transformation_rule (rule_id, job_id, target_field, rule_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                stored.rule_id,
                stored.job_id,
                stored.target_field,
                serde_json::to_string(&stored.rule)?,
                format_timestamp(now)
            ],
        )?;
        Ok(())
    }

    /// 作业的全部规则（按创建顺序）
    pub fn list_rules(&self, job_id: &str) -> RepositoryResult<Vec<StoredRule>> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT rule_id, target_field, rule_json FROM transformation_rule
                WHERE job_id = ?1 ORDER BY created_at, rowid
                "#,
            )?;
            let rows = stmt
                .query_map(params![job_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(|(rule_id, target_field, raw)| {
                Ok(StoredRule {
                    rule_id,
                    job_id: job_id.to_string(),
                    target_field,
                    rule: serde_json::from_str(&raw)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_shared_connection;
    use crate::domain::mapping::{ColumnMapping, MappingStatus, ValueMapEntry};
    use crate::domain::types::UnmappedFieldAction;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn repo() -> (NamedTempFile, ImportJobRepository) {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_shared_connection(temp.path().to_str().unwrap()).unwrap();
        (temp, ImportJobRepository::new(conn).unwrap())
    }

    fn job(id: &str, tenant: &str) -> ImportJob {
        ImportJob::new(
            id.to_string(),
            tenant,
            "legacy_hr",
            "case",
            JobOptions::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_and_get_job() {
        let (_temp, repo) = repo();
        repo.insert(&job("J1", "T1")).unwrap();

        let loaded = repo.get("J1").unwrap();
        assert_eq!(loaded.state, JobState::Created);
        assert_eq!(loaded.tenant_id, "T1");
        assert!(repo.find_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_compare_and_set_state() {
        let (_temp, repo) = repo();
        repo.insert(&job("J1", "T1")).unwrap();

        let now = Utc::now();
        assert!(repo
            .compare_and_set_state("J1", JobState::Created, JobState::Analyzing, None, now)
            .unwrap());
        // 旧状态不匹配
        assert!(!repo
            .compare_and_set_state("J1", JobState::Created, JobState::Mapping, None, now)
            .unwrap());
        assert_eq!(repo.get("J1").unwrap().state, JobState::Analyzing);
    }

    #[test]
    fn test_list_by_tenant() {
        let (_temp, repo) = repo();
        repo.insert(&job("J1", "T1")).unwrap();
        repo.insert(&job("J2", "T1")).unwrap();
        repo.insert(&job("J3", "T2")).unwrap();

        assert_eq!(repo.list_by_tenant("T1").unwrap().len(), 2);
        assert_eq!(repo.list_by_tenant("T2").unwrap().len(), 1);
    }

    #[test]
    fn test_mapping_and_value_map_persistence() {
        let (_temp, repo) = repo();
        repo.insert(&job("J1", "T1")).unwrap();
        let now = Utc::now();

        let mapping = FieldMapping {
            columns: vec![ColumnMapping {
                source_column: "Incident_Type".to_string(),
                target_field: Some("category".to_string()),
                confidence: 0.9,
                status: MappingStatus::AutoAccepted,
                rule_id: None,
                unmapped_action: UnmappedFieldAction::Ignore,
            }],
            ..Default::default()
        };
        repo.save_mapping("J1", &mapping, now).unwrap();
        assert_eq!(repo.find_mapping("J1").unwrap(), Some(mapping));

        let map = ValueMap {
            target_field: "category".to_string(),
            entries: vec![ValueMapEntry {
                source_value: "Theft".to_string(),
                target_value: json!("THEFT"),
                confidence: 0.95,
            }],
            default_value: None,
        };
        repo.save_value_map("J1", &map, false, now).unwrap();
        assert!(!repo.is_value_map_confirmed("J1", "category").unwrap());
        repo.save_value_map("J1", &map, true, now).unwrap();
        assert!(repo.is_value_map_confirmed("J1", "category").unwrap());
        assert_eq!(repo.list_value_maps("J1").unwrap(), vec![map]);
    }
}

// ==========================================
// 数据迁移导入引擎 - 校验问题仓储
// ==========================================
// 职责: validation_issue / validation_run 表的读写
// 说明: 每次校验整体替换该作业的问题列表（重复校验无副作用）
// ==========================================

use crate::domain::types::{IssueCategory, Severity};
use crate::domain::validation::{ValidationIssue, ValidationReport};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

struct IssueRow {
    issue_id: String,
    job_id: String,
    row_number: Option<i64>,
    severity: String,
    category: String,
    field: Option<String>,
    code: String,
    message: String,
    source_value: Option<String>,
    auto_fixable: i32,
    suggested_fix: Option<String>,
    resolved: i32,
    created_at: String,
}

fn read_issue_row(row: &Row) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        issue_id: row.get(0)?,
        job_id: row.get(1)?,
        row_number: row.get(2)?,
        severity: row.get(3)?,
        category: row.get(4)?,
        field: row.get(5)?,
        code: row.get(6)?,
        message: row.get(7)?,
        source_value: row.get(8)?,
        auto_fixable: row.get(9)?,
        suggested_fix: row.get(10)?,
        resolved: row.get(11)?,
        created_at: row.get(12)?,
    })
}

impl IssueRow {
    fn into_issue(self) -> RepositoryResult<ValidationIssue> {
        Ok(ValidationIssue {
            issue_id: self.issue_id,
            job_id: self.job_id,
            row_number: self.row_number.map(|v| v as usize),
            severity: Severity::parse(&self.severity),
            category: IssueCategory::parse(&self.category),
            field: self.field,
            code: self.code,
            message: self.message,
            source_value: self.source_value,
            auto_fixable: self.auto_fixable != 0,
            suggested_fix: self.suggested_fix,
            resolved: self.resolved != 0,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// 最近一次校验的汇总
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRunSummary {
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub records_checked: usize,
}

// ==========================================
// ValidationIssueRepository
// ==========================================
pub struct ValidationIssueRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ValidationIssueRepository {
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
            CREATE TABLE IF NOT EXISTS validation_issue (
              issue_id TEXT PRIMARY KEY,
              job_id TEXT NOT NULL,
              row_number INTEGER,
              severity TEXT NOT NULL CHECK(severity IN ('ERROR', 'WARNING', 'INFO')),
              category TEXT NOT NULL,
              field TEXT,
              code TEXT NOT NULL,
              message TEXT NOT NULL,
              source_value TEXT,
              auto_fixable INTEGER NOT NULL DEFAULT 0,
              suggested_fix TEXT,
              resolved INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_validation_issue_job ON validation_issue(job_id, row_number);

            CREATE TABLE IF NOT EXISTS validation_run (
              job_id TEXT PRIMARY KEY,
              error_count INTEGER NOT NULL,
              warning_count INTEGER NOT NULL,
              info_count INTEGER NOT NULL,
              records_checked INTEGER NOT NULL,
              run_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// 用新报告整体替换作业的问题列表（单事务）
    pub fn replace_for_job(
        &self,
        report: &ValidationReport,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "DELETE FROM validation_issue WHERE job_id = ?1",
            params![report.job_id],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO validation_issue (
                  issue_id, job_id, row_number, severity, category, field, code,
                  message, source_value, auto_fixable, suggested_fix, resolved, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )?;
            for issue in &report.issues {
                stmt.execute(params![
                    issue.issue_id,
                    issue.job_id,
                    issue.row_number.map(|v| v as i64),
                    issue.severity.as_str(),
                    issue.category.as_str(),
                    issue.field,
                    issue.code,
                    issue.message,
                    issue.source_value,
                    issue.auto_fixable as i32,
                    issue.suggested_fix,
                    issue.resolved as i32,
                    format_timestamp(issue.created_at),
                ])?;
            }
        }

        tx.execute(
            r#"
            INSERT INTO validation_run (job_id, error_count, warning_count, info_count, records_checked, run_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(job_id) DO UPDATE SET
              error_count = ?2, warning_count = ?3, info_count = ?4, records_checked = ?5, run_at = ?6
            "#,
            params![
                report.job_id,
                report.error_count as i64,
                report.warning_count as i64,
                report.info_count as i64,
                report.records_checked as i64,
                format_timestamp(now),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// 作业的问题列表（按行号排序，作业级问题在前）
    pub fn list_by_job(&self, job_id: &str) -> RepositoryResult<Vec<ValidationIssue>> {
        let rows = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT issue_id, job_id, row_number, severity, category, field, code,
                       message, source_value, auto_fixable, suggested_fix, resolved, created_at
                FROM validation_issue
                WHERE job_id = ?1
                ORDER BY COALESCE(row_number, 0), rowid
                "#,
            )?;
            let rows = stmt
                .query_map(params![job_id], read_issue_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(IssueRow::into_issue).collect()
    }

    /// 标记问题已处理
    pub fn mark_resolved(&self, job_id: &str, issue_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE validation_issue SET resolved = 1 WHERE job_id = ?1 AND issue_id = ?2",
            params![job_id, issue_id],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "ValidationIssue".to_string(),
                id: issue_id.to_string(),
            });
        }
        Ok(())
    }

    /// 最近一次校验汇总（未校验返回 None）
    pub fn latest_run(&self, job_id: &str) -> RepositoryResult<Option<ValidationRunSummary>> {
        let conn = self.get_conn()?;
        let summary = conn
            .query_row(
                r#"
                SELECT error_count, warning_count, info_count, records_checked
                FROM validation_run WHERE job_id = ?1
                "#,
                params![job_id],
                |row| {
                    Ok(ValidationRunSummary {
                        error_count: row.get::<_, i64>(0)? as usize,
                        warning_count: row.get::<_, i64>(1)? as usize,
                        info_count: row.get::<_, i64>(2)? as usize,
                        records_checked: row.get::<_, i64>(3)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(summary)
    }
}

// ==========================================
// 数据迁移导入引擎 - 导入台账仓储
// ==========================================
// 职责: imported_record / restore_point / import_error_log / job_batch 表
// 说明: imported_record 与 restore_point 的写入发生在目标存储的批次事务内
//       （见 target_store::SqliteTargetStore），本仓储负责建表与读取
// 红线: 回滚只读取台账，不重新推导
// ==========================================

use crate::domain::job::JobCounts;
use crate::domain::record::{ImportErrorLog, ImportedRecord, RestorePoint};
use crate::domain::types::{RecordAction, RestorePointStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// 台账表结构（幂等）
///
/// restore_point 上的部分唯一索引保证每个作业至多一个 ACTIVE 还原点
pub(crate) fn ensure_ledger_tables(conn: &Connection) -> RepositoryResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS imported_record (
          job_id TEXT NOT NULL,
          source_record_id TEXT NOT NULL,
          target_entity_id TEXT NOT NULL,
          entity_type TEXT NOT NULL,
          row_number INTEGER NOT NULL,
          action TEXT NOT NULL CHECK(action IN ('CREATED', 'UPDATED', 'SKIPPED')),
          content_hash TEXT NOT NULL,
          previous_payload_json TEXT,
          previous_hash TEXT,
          rolled_back INTEGER NOT NULL DEFAULT 0,
          imported_at TEXT NOT NULL,
          PRIMARY KEY (job_id, source_record_id)
        );
        CREATE INDEX IF NOT EXISTS idx_imported_record_entity ON imported_record(target_entity_id);

        CREATE TABLE IF NOT EXISTS restore_point (
          restore_point_id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          tenant_id TEXT NOT NULL,
          created_at TEXT NOT NULL,
          expires_at TEXT NOT NULL,
          entity_types_json TEXT NOT NULL,
          record_count INTEGER NOT NULL DEFAULT 0,
          status TEXT NOT NULL CHECK(status IN ('ACTIVE', 'USED', 'EXPIRED'))
        );
        CREATE UNIQUE INDEX IF NOT EXISTS uq_restore_point_active
          ON restore_point(job_id) WHERE status = 'ACTIVE';

        CREATE TABLE IF NOT EXISTS import_error_log (
          error_id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          batch_index INTEGER NOT NULL,
          row_number INTEGER NOT NULL,
          source_record_id TEXT NOT NULL,
          message TEXT NOT NULL,
          attempts INTEGER NOT NULL,
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_import_error_log_job ON import_error_log(job_id, row_number);

        CREATE TABLE IF NOT EXISTS job_batch (
          job_id TEXT NOT NULL,
          batch_index INTEGER NOT NULL,
          record_count INTEGER NOT NULL,
          created_count INTEGER NOT NULL DEFAULT 0,
          updated_count INTEGER NOT NULL DEFAULT 0,
          skipped_count INTEGER NOT NULL DEFAULT 0,
          committed_at TEXT NOT NULL,
          PRIMARY KEY (job_id, batch_index)
        );
        "#,
    )?;
    Ok(())
}

struct ImportedRow {
    job_id: String,
    source_record_id: String,
    target_entity_id: String,
    entity_type: String,
    row_number: i64,
    action: String,
    content_hash: String,
    previous_payload_json: Option<String>,
    previous_hash: Option<String>,
    rolled_back: i32,
    imported_at: String,
}

fn read_imported_row(row: &Row) -> rusqlite::Result<ImportedRow> {
    Ok(ImportedRow {
        job_id: row.get(0)?,
        source_record_id: row.get(1)?,
        target_entity_id: row.get(2)?,
        entity_type: row.get(3)?,
        row_number: row.get(4)?,
        action: row.get(5)?,
        content_hash: row.get(6)?,
        previous_payload_json: row.get(7)?,
        previous_hash: row.get(8)?,
        rolled_back: row.get(9)?,
        imported_at: row.get(10)?,
    })
}

impl ImportedRow {
    fn into_record(self) -> RepositoryResult<ImportedRecord> {
        Ok(ImportedRecord {
            job_id: self.job_id,
            source_record_id: self.source_record_id,
            target_entity_id: self.target_entity_id,
            entity_type: self.entity_type,
            row_number: self.row_number as usize,
            action: RecordAction::parse(&self.action),
            content_hash: self.content_hash,
            previous_payload: self
                .previous_payload_json
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            previous_hash: self.previous_hash,
            rolled_back: self.rolled_back != 0,
            imported_at: parse_timestamp(&self.imported_at)?,
        })
    }
}

type RestorePointRow = (String, String, String, String, String, String, i64, String);

const RESTORE_POINT_COLUMNS: &str =
    "restore_point_id, job_id, tenant_id, created_at, expires_at, entity_types_json, record_count, status";

fn read_restore_point_row(row: &Row) -> rusqlite::Result<RestorePointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_restore_point(raw: RestorePointRow) -> RepositoryResult<RestorePoint> {
    let (restore_point_id, job_id, tenant_id, created_at, expires_at, entity_types, record_count, status) =
        raw;
    Ok(RestorePoint {
        restore_point_id,
        job_id,
        tenant_id,
        created_at: parse_timestamp(&created_at)?,
        expires_at: parse_timestamp(&expires_at)?,
        entity_types: serde_json::from_str(&entity_types)?,
        record_count: record_count as usize,
        status: RestorePointStatus::parse(&status),
    })
}

// ==========================================
// ImportedRecordRepository
// ==========================================
pub struct ImportedRecordRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ImportedRecordRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let repo = Self { conn };
        {
            let conn = repo.get_conn()?;
            ensure_ledger_tables(&conn)?;
        }
        Ok(repo)
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ===== imported_record =====

    /// 作业的导入链接（按行号升序）
    ///
    /// # 参数
    /// - include_rolled_back: 是否包含已回滚的链接
    pub fn list_by_job(
        &self,
        job_id: &str,
        include_rolled_back: bool,
    ) -> RepositoryResult<Vec<ImportedRecord>> {
        let rows = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT job_id, source_record_id, target_entity_id, entity_type, row_number,
                       action, content_hash, previous_payload_json, previous_hash,
                       rolled_back, imported_at
                FROM imported_record
                WHERE job_id = ?1 AND (?2 = 1 OR rolled_back = 0)
                ORDER BY row_number, source_record_id
                "#,
            )?;
            let rows = stmt
                .query_map(params![job_id, include_rolled_back as i32], read_imported_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(ImportedRow::into_record).collect()
    }

    /// 仍然生效的链接数（不含已回滚）
    pub fn count_active(&self, job_id: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM imported_record WHERE job_id = ?1 AND rolled_back = 0",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ===== restore_point =====

    /// 作业最近的还原点（任意状态）
    pub fn latest_restore_point(&self, job_id: &str) -> RepositoryResult<Option<RestorePoint>> {
        let raw = {
            let conn = self.get_conn()?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM restore_point WHERE job_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    RESTORE_POINT_COLUMNS
                ),
                params![job_id],
                read_restore_point_row,
            )
            .optional()?
        };
        raw.map(into_restore_point).transpose()
    }

    /// 更新还原点状态
    pub fn set_restore_point_status(
        &self,
        restore_point_id: &str,
        status: RestorePointStatus,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE restore_point SET status = ?2 WHERE restore_point_id = ?1",
            params![restore_point_id, status.as_str()],
        )?;
        Ok(())
    }

    /// 将超出保留期的 ACTIVE 还原点标记为 EXPIRED
    ///
    /// # 返回
    /// - 被标记的还原点数量
    pub fn expire_restore_points(&self, now: DateTime<Utc>) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE restore_point SET status = 'EXPIRED' WHERE status = 'ACTIVE' AND expires_at <= ?1",
            params![format_timestamp(now)],
        )?;
        Ok(affected)
    }

    // ===== import_error_log =====

    pub fn insert_error_log(&self, log: &ImportErrorLog) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO import_error_log (
              error_id, job_id, batch_index, row_number, source_record_id, message, attempts, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                log.error_id,
                log.job_id,
                log.batch_index as i64,
                log.row_number as i64,
                log.source_record_id,
                log.message,
                log.attempts,
                format_timestamp(log.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_error_logs(&self, job_id: &str) -> RepositoryResult<Vec<ImportErrorLog>> {
        let rows = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT error_id, job_id, batch_index, row_number, source_record_id, message, attempts, created_at
                FROM import_error_log WHERE job_id = ?1 ORDER BY row_number, rowid
                "#,
            )?;
            let rows = stmt
                .query_map(params![job_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(
                |(error_id, job_id, batch_index, row_number, source_record_id, message, attempts, created_at)| {
                    Ok(ImportErrorLog {
                        error_id,
                        job_id,
                        batch_index: batch_index as usize,
                        row_number: row_number as usize,
                        source_record_id,
                        message,
                        attempts,
                        created_at: parse_timestamp(&created_at)?,
                    })
                },
            )
            .collect()
    }

    /// 清除作业的失败日志（新一轮执行开始时）
    pub fn clear_error_logs(&self, job_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM import_error_log WHERE job_id = ?1", params![job_id])?;
        Ok(())
    }

    /// 删除未提交批次的失败日志（恢复执行前，这些批次会被重新派发）
    pub fn prune_uncommitted_error_logs(&self, job_id: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            DELETE FROM import_error_log
            WHERE job_id = ?1
              AND batch_index NOT IN (SELECT batch_index FROM job_batch WHERE job_id = ?1)
            "#,
            params![job_id],
        )?;
        Ok(affected)
    }

    // ===== job_batch (可恢复游标) =====

    /// 已提交批次的累计计数（新建/更新/跳过 + 这些批次内剔除的失败记录）
    ///
    /// 不含畸形行与文件内重复行，二者由恢复执行时重读文件重新统计
    pub fn committed_counts(&self, job_id: &str) -> RepositoryResult<JobCounts> {
        let conn = self.get_conn()?;
        let (imported, updated, skipped): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COALESCE(SUM(created_count), 0), COALESCE(SUM(updated_count), 0), COALESCE(SUM(skipped_count), 0)
            FROM job_batch WHERE job_id = ?1
            "#,
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let failed: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM import_error_log
            WHERE job_id = ?1
              AND batch_index IN (SELECT batch_index FROM job_batch WHERE job_id = ?1)
            "#,
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(JobCounts {
            source: 0,
            imported: imported as usize,
            updated: updated as usize,
            skipped: skipped as usize,
            failed: failed as usize,
        })
    }


    /// 已提交的批次序号集合
    pub fn committed_batches(&self, job_id: &str) -> RepositoryResult<BTreeSet<usize>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT batch_index FROM job_batch WHERE job_id = ?1")?;
        let set = stmt
            .query_map(params![job_id], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|v| v as usize))
            .collect::<rusqlite::Result<BTreeSet<usize>>>()?;
        Ok(set)
    }

    /// 重置游标（新一轮执行，而非恢复）
    pub fn clear_batches(&self, job_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM job_batch WHERE job_id = ?1", params![job_id])?;
        Ok(())
    }
}

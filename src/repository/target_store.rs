// ==========================================
// 数据迁移导入引擎 - 目标记录存储
// ==========================================
// 职责: 目标领域记录的事务化批量写入 / 回滚 / 内容哈希
// 约束: 一个批次 = 一个事务（目标记录 + 导入台账 + 还原点 + 批次游标）
// 幂等: (tenant, source system, source record id, entity type) 唯一
// ==========================================

use crate::domain::record::{RecordKey, RestorePoint, TargetRecord};
use crate::domain::types::RecordAction;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::format_timestamp;
use crate::repository::imported_record_repo::ensure_ledger_tables;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// 记录内容哈希（对象键排序后序列化）
pub fn content_hash(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ==========================================
// 批次写入请求 / 结果
// ==========================================

/// 单条写入
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub index: usize,       // 批次内序号
    pub row_number: usize,
    pub key: RecordKey,
    pub entity_id: String,
    pub payload: Value,
}

/// 一个批次的提交请求
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub job_id: String,
    pub batch_index: usize,
    pub incremental: bool,
    pub restore_point: RestorePoint, // 首个批次提交时创建（已存在 ACTIVE 时忽略）
    pub writes: Vec<RecordWrite>,
    pub committed_at: DateTime<Utc>,
    pub guard: CommitGuard,
}

const GUARD_PENDING: u8 = 0;
const GUARD_COMMITTING: u8 = 1;
const GUARD_ABANDONED: u8 = 2;

/// 批次提交守卫: 调用方超时放弃 与 存储端执行 COMMIT 二者只有一个能成功
///
/// 存储实现在 COMMIT 前调用 `begin_commit`；调用方超时后调用 `abandon`。
/// `abandon` 返回 false 说明 COMMIT 已开始，调用方须等待真实结果。
#[derive(Debug, Clone, Default)]
pub struct CommitGuard {
    state: Arc<AtomicU8>,
}

impl CommitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 存储端: 进入 COMMIT；false 表示调用方已放弃，事务须回滚
    pub fn begin_commit(&self) -> bool {
        self.state
            .compare_exchange(GUARD_PENDING, GUARD_COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 调用方: 放弃尚未开始 COMMIT 的批次
    pub fn abandon(&self) -> bool {
        self.state
            .compare_exchange(GUARD_PENDING, GUARD_ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::SeqCst) == GUARD_ABANDONED
    }
}

/// 单条写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub index: usize,
    pub source_record_id: String,
    pub action: RecordAction,
    pub new_link: bool, // 是否新增了导入链接
}

/// 回滚项
#[derive(Debug, Clone)]
pub struct RollbackItem {
    pub source_record_id: String,
    pub target_entity_id: String,
    pub action: RecordAction,
    pub previous_payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RollbackBatch {
    pub job_id: String,
    pub items: Vec<RollbackItem>,
}

// ==========================================
// TargetRecordStore Trait
// ==========================================
// 实现者: SqliteTargetStore（同库事务）/ 测试中的故障注入包装
#[async_trait]
pub trait TargetRecordStore: Send + Sync {
    /// 按自然键查询
    async fn find_by_key(&self, key: &RecordKey) -> RepositoryResult<Option<TargetRecord>>;

    /// 按实体 ID 查询
    async fn find_by_id(&self, entity_id: &str) -> RepositoryResult<Option<TargetRecord>>;

    /// 事务化提交一个批次
    ///
    /// # 返回
    /// - Ok(Vec<WriteOutcome>): 全部写入成功
    /// - Err(RecordWriteFailed { index }): 批次内某条记录失败，整个批次未提交
    /// - Err(其他): 存储层故障，整个批次未提交
    async fn commit_batch(&self, batch: BatchCommit) -> RepositoryResult<Vec<WriteOutcome>>;

    /// 事务化回滚一个批次（删除新建 / 还原更新 / 标记台账）
    ///
    /// # 返回
    /// - 实际处理的记录数
    async fn rollback_batch(&self, batch: RollbackBatch) -> RepositoryResult<usize>;
}

// ==========================================
// SqliteTargetStore
// ==========================================
pub struct SqliteTargetStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTargetStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let store = Self { conn };
        {
            let conn = lock(&store.conn)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS target_entity (
                  entity_id TEXT PRIMARY KEY,
                  tenant_id TEXT NOT NULL,
                  source_system TEXT NOT NULL,
                  source_record_id TEXT NOT NULL,
                  entity_type TEXT NOT NULL,
                  payload_json TEXT NOT NULL,
                  content_hash TEXT NOT NULL,
                  UNIQUE (tenant_id, source_system, source_record_id, entity_type)
                );
                "#,
            )?;
            ensure_ledger_tables(&conn)?;
        }
        Ok(store)
    }

    /// 直接修改目标记录内容（模拟导入后的独立修改）
    pub fn update_payload(&self, entity_id: &str, payload: &Value) -> RepositoryResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE target_entity SET payload_json = ?2, content_hash = ?3 WHERE entity_id = ?1",
            params![entity_id, payload.to_string(), content_hash(payload)],
        )?;
        Ok(())
    }

    /// 某租户某实体类型的全部目标记录（按 source_record_id 排序）
    pub fn list(&self, tenant_id: &str, entity_type: &str) -> RepositoryResult<Vec<TargetRecord>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT entity_id, tenant_id, source_system, source_record_id, entity_type, payload_json, content_hash
            FROM target_entity WHERE tenant_id = ?1 AND entity_type = ?2
            ORDER BY source_record_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![tenant_id, entity_type], read_target_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawTarget::into_record).collect()
    }

    fn commit_batch_blocking(
        conn: &Arc<Mutex<Connection>>,
        batch: &BatchCommit,
    ) -> RepositoryResult<Vec<WriteOutcome>> {
        let conn = lock(conn)?;
        let tx = conn.unchecked_transaction()?;

        Self::ensure_restore_point_tx(&tx, &batch.restore_point, batch.committed_at)?;

        let mut outcomes = Vec::with_capacity(batch.writes.len());
        for write in &batch.writes {
            // 约束/数据类错误归属到单条记录，其余视为存储故障
            let outcome = Self::apply_write_tx(&tx, batch, write).map_err(|e| match e {
                RepositoryError::UniqueConstraintViolation(msg)
                | RepositoryError::ForeignKeyViolation(msg)
                | RepositoryError::SerializationError(msg) => RepositoryError::RecordWriteFailed {
                    index: write.index,
                    message: msg,
                },
                other => other,
            })?;
            outcomes.push(outcome);
        }

        let tally = |action: RecordAction| outcomes.iter().filter(|o| o.action == action).count() as i64;
        tx.execute(
            r#"
            INSERT INTO job_batch (
              job_id, batch_index, record_count, created_count, updated_count, skipped_count, committed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(job_id, batch_index) DO UPDATE SET
              record_count = ?3, created_count = ?4, updated_count = ?5, skipped_count = ?6, committed_at = ?7
            "#,
            params![
                batch.job_id,
                batch.batch_index as i64,
                batch.writes.len() as i64,
                tally(RecordAction::Created),
                tally(RecordAction::Updated),
                tally(RecordAction::Skipped),
                format_timestamp(batch.committed_at)
            ],
        )?;

        tx.execute(
            r#"
            UPDATE restore_point SET record_count = (
              SELECT COUNT(*) FROM imported_record
              WHERE job_id = ?1 AND rolled_back = 0 AND action != 'SKIPPED'
            )
            WHERE job_id = ?1 AND status = 'ACTIVE'
            "#,
            params![batch.job_id],
        )?;

        if !batch.guard.begin_commit() {
            // 调用方已超时放弃，事务随 tx 析构回滚
            return Err(RepositoryError::Timeout(format!(
                "批次 {} 已被调用方放弃，未提交",
                batch.batch_index
            )));
        }
        tx.commit()?;
        Ok(outcomes)
    }

    /// 首个批次前创建还原点；已过期的 ACTIVE 还原点先标记 EXPIRED
    fn ensure_restore_point_tx(
        tx: &Transaction,
        rp: &RestorePoint,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        tx.execute(
            "UPDATE restore_point SET status = 'EXPIRED' WHERE job_id = ?1 AND status = 'ACTIVE' AND expires_at <= ?2",
            params![rp.job_id, format_timestamp(now)],
        )?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO restore_point (
              restore_point_id, job_id, tenant_id, created_at, expires_at,
              entity_types_json, record_count, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'ACTIVE')
            "#,
            params![
                rp.restore_point_id,
                rp.job_id,
                rp.tenant_id,
                format_timestamp(rp.created_at),
                format_timestamp(rp.expires_at),
                serde_json::to_string(&rp.entity_types)?,
            ],
        )?;
        Ok(())
    }

    fn apply_write_tx(
        tx: &Transaction,
        batch: &BatchCommit,
        write: &RecordWrite,
    ) -> RepositoryResult<WriteOutcome> {
        if !write.payload.is_object() {
            return Err(RepositoryError::RecordWriteFailed {
                index: write.index,
                message: "目标记录必须是 JSON 对象".to_string(),
            });
        }

        let key = &write.key;
        let existing: Option<(String, String, String)> = tx
            .query_row(
                r#"
                SELECT entity_id, payload_json, content_hash FROM target_entity
                WHERE tenant_id = ?1 AND source_system = ?2 AND source_record_id = ?3 AND entity_type = ?4
                "#,
                params![key.tenant_id, key.source_system, key.source_record_id, key.entity_type],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let new_hash = content_hash(&write.payload);
        let (action, entity_id, hash, previous_payload, previous_hash) = match existing {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO target_entity (
                      entity_id, tenant_id, source_system, source_record_id, entity_type, payload_json, content_hash
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        write.entity_id,
                        key.tenant_id,
                        key.source_system,
                        key.source_record_id,
                        key.entity_type,
                        write.payload.to_string(),
                        new_hash,
                    ],
                )?;
                (RecordAction::Created, write.entity_id.clone(), new_hash, None, None)
            }
            Some((entity_id, old_payload, old_hash)) if batch.incremental => {
                tx.execute(
                    "UPDATE target_entity SET payload_json = ?2, content_hash = ?3 WHERE entity_id = ?1",
                    params![entity_id, write.payload.to_string(), new_hash],
                )?;
                (
                    RecordAction::Updated,
                    entity_id,
                    new_hash,
                    Some(old_payload),
                    Some(old_hash),
                )
            }
            Some((entity_id, _, old_hash)) => (RecordAction::Skipped, entity_id, old_hash, None, None),
        };

        // 已回滚的链接可被重新激活；仍生效的链接保持原样（重复执行不新增链接）
        let inserted = tx.execute(
            r#"
            INSERT INTO imported_record (
              job_id, source_record_id, target_entity_id, entity_type, row_number, action,
              content_hash, previous_payload_json, previous_hash, rolled_back, imported_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)
            ON CONFLICT(job_id, source_record_id) DO UPDATE SET
              target_entity_id = excluded.target_entity_id,
              entity_type = excluded.entity_type,
              row_number = excluded.row_number,
              action = excluded.action,
              content_hash = excluded.content_hash,
              previous_payload_json = excluded.previous_payload_json,
              previous_hash = excluded.previous_hash,
              rolled_back = 0,
              imported_at = excluded.imported_at
            WHERE imported_record.rolled_back = 1
            "#,
            params![
                batch.job_id,
                key.source_record_id,
                entity_id,
                key.entity_type,
                write.row_number as i64,
                action.as_str(),
                hash,
                previous_payload,
                previous_hash,
                format_timestamp(batch.committed_at),
            ],
        )?;

        if inserted == 0 && action == RecordAction::Updated {
            // 同一作业增量重跑: 刷新哈希，避免回滚时误判为独立修改
            tx.execute(
                "UPDATE imported_record SET content_hash = ?3 WHERE job_id = ?1 AND source_record_id = ?2",
                params![batch.job_id, key.source_record_id, hash],
            )?;
        }

        Ok(WriteOutcome {
            index: write.index,
            source_record_id: key.source_record_id.clone(),
            action,
            new_link: inserted == 1,
        })
    }

    fn rollback_batch_blocking(
        conn: &Arc<Mutex<Connection>>,
        batch: &RollbackBatch,
    ) -> RepositoryResult<usize> {
        let conn = lock(conn)?;
        let tx = conn.unchecked_transaction()?;

        let mut processed = 0;
        for item in &batch.items {
            match item.action {
                RecordAction::Created => {
                    tx.execute(
                        "DELETE FROM target_entity WHERE entity_id = ?1",
                        params![item.target_entity_id],
                    )?;
                }
                RecordAction::Updated => {
                    if let Some(previous) = &item.previous_payload {
                        tx.execute(
                            "UPDATE target_entity SET payload_json = ?2, content_hash = ?3 WHERE entity_id = ?1",
                            params![item.target_entity_id, previous.to_string(), content_hash(previous)],
                        )?;
                    }
                }
                RecordAction::Skipped => {}
            }
            tx.execute(
                "UPDATE imported_record SET rolled_back = 1 WHERE job_id = ?1 AND source_record_id = ?2",
                params![batch.job_id, item.source_record_id],
            )?;
            processed += 1;
        }

        tx.execute(
            r#"
            UPDATE restore_point SET record_count = (
              SELECT COUNT(*) FROM imported_record
              WHERE job_id = ?1 AND rolled_back = 0 AND action != 'SKIPPED'
            )
            WHERE job_id = ?1 AND status = 'ACTIVE'
            "#,
            params![batch.job_id],
        )?;

        tx.commit()?;
        Ok(processed)
    }

    fn find_one_blocking(
        conn: &Arc<Mutex<Connection>>,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> RepositoryResult<Option<TargetRecord>> {
        let conn = lock(conn)?;
        let raw = conn.query_row(sql, args, read_target_row).optional()?;
        raw.map(RawTarget::into_record).transpose()
    }
}

#[async_trait]
impl TargetRecordStore for SqliteTargetStore {
    async fn find_by_key(&self, key: &RecordKey) -> RepositoryResult<Option<TargetRecord>> {
        let conn = self.conn.clone();
        let key = key.clone();
        run_blocking(move || {
            Self::find_one_blocking(
                &conn,
                r#"
                SELECT entity_id, tenant_id, source_system, source_record_id, entity_type, payload_json, content_hash
                FROM target_entity
                WHERE tenant_id = ?1 AND source_system = ?2 AND source_record_id = ?3 AND entity_type = ?4
                "#,
                params![key.tenant_id, key.source_system, key.source_record_id, key.entity_type],
            )
        })
        .await
    }

    async fn find_by_id(&self, entity_id: &str) -> RepositoryResult<Option<TargetRecord>> {
        let conn = self.conn.clone();
        let entity_id = entity_id.to_string();
        run_blocking(move || {
            Self::find_one_blocking(
                &conn,
                r#"
                SELECT entity_id, tenant_id, source_system, source_record_id, entity_type, payload_json, content_hash
                FROM target_entity WHERE entity_id = ?1
                "#,
                params![entity_id],
            )
        })
        .await
    }

    async fn commit_batch(&self, batch: BatchCommit) -> RepositoryResult<Vec<WriteOutcome>> {
        let conn = self.conn.clone();
        run_blocking(move || Self::commit_batch_blocking(&conn, &batch)).await
    }

    async fn rollback_batch(&self, batch: RollbackBatch) -> RepositoryResult<usize> {
        let conn = self.conn.clone();
        run_blocking(move || Self::rollback_batch_blocking(&conn, &batch)).await
    }
}

// ==========================================
// 内部辅助
// ==========================================

struct RawTarget {
    entity_id: String,
    tenant_id: String,
    source_system: String,
    source_record_id: String,
    entity_type: String,
    payload_json: String,
    content_hash: String,
}

fn read_target_row(row: &rusqlite::Row) -> rusqlite::Result<RawTarget> {
    Ok(RawTarget {
        entity_id: row.get(0)?,
        tenant_id: row.get(1)?,
        source_system: row.get(2)?,
        source_record_id: row.get(3)?,
        entity_type: row.get(4)?,
        payload_json: row.get(5)?,
        content_hash: row.get(6)?,
    })
}

impl RawTarget {
    fn into_record(self) -> RepositoryResult<TargetRecord> {
        Ok(TargetRecord {
            entity_id: self.entity_id,
            tenant_id: self.tenant_id,
            source_system: self.source_system,
            source_record_id: self.source_record_id,
            entity_type: self.entity_type,
            payload: serde_json::from_str(&self.payload_json)?,
            content_hash: self.content_hash,
        })
    }
}

fn lock(conn: &Arc<Mutex<Connection>>) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| RepositoryError::LockError(e.to_string()))
}

/// 在阻塞线程池执行同步 SQLite 操作（使 tokio 超时可生效）
async fn run_blocking<T, F>(f: F) -> RepositoryResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RepositoryResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RepositoryError::InternalError(format!("阻塞任务失败: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_shared_connection;
    use crate::domain::types::RestorePointStatus;
    use crate::repository::imported_record_repo::ImportedRecordRepository;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn key(id: &str) -> RecordKey {
        RecordKey {
            tenant_id: "T1".to_string(),
            source_system: "legacy".to_string(),
            source_record_id: id.to_string(),
            entity_type: "case".to_string(),
        }
    }

    fn batch(job_id: &str, index: usize, incremental: bool, writes: Vec<RecordWrite>) -> BatchCommit {
        let now = Utc::now();
        BatchCommit {
            job_id: job_id.to_string(),
            batch_index: index,
            incremental,
            restore_point: RestorePoint {
                restore_point_id: format!("RP-{}-{}", job_id, index),
                job_id: job_id.to_string(),
                tenant_id: "T1".to_string(),
                created_at: now,
                expires_at: now + Duration::days(7),
                entity_types: vec!["case".to_string()],
                record_count: 0,
                status: RestorePointStatus::Active,
            },
            writes,
            committed_at: now,
            guard: CommitGuard::new(),
        }
    }

    fn write(index: usize, id: &str, payload: Value) -> RecordWrite {
        RecordWrite {
            index,
            row_number: index + 1,
            key: key(id),
            entity_id: format!("E-{}", id),
            payload,
        }
    }

    fn setup() -> (NamedTempFile, SqliteTargetStore, ImportedRecordRepository) {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_shared_connection(temp.path().to_str().unwrap()).unwrap();
        let store = SqliteTargetStore::new(conn.clone()).unwrap();
        let ledger = ImportedRecordRepository::new(conn).unwrap();
        (temp, store, ledger)
    }

    #[test]
    fn test_content_hash_is_key_order_independent() {
        let a = json!({"a": 1, "b": "x"});
        let b = json!({"b": "x", "a": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"a": 2, "b": "x"})));
    }

    #[tokio::test]
    async fn test_commit_creates_restore_point_and_links() {
        let (_temp, store, ledger) = setup();
        let outcomes = store
            .commit_batch(batch("J1", 0, false, vec![write(0, "R1", json!({"title": "a"}))]))
            .await
            .unwrap();
        assert_eq!(outcomes[0].action, RecordAction::Created);
        assert!(outcomes[0].new_link);

        let rp = ledger.latest_restore_point("J1").unwrap().unwrap();
        assert_eq!(rp.status, RestorePointStatus::Active);
        assert_eq!(rp.record_count, 1);
        assert_eq!(ledger.count_active("J1").unwrap(), 1);
        assert!(ledger.committed_batches("J1").unwrap().contains(&0));
    }

    #[tokio::test]
    async fn test_rerun_skips_without_new_links() {
        let (_temp, store, ledger) = setup();
        let w = || vec![write(0, "R1", json!({"title": "a"}))];
        store.commit_batch(batch("J1", 0, false, w())).await.unwrap();
        let outcomes = store.commit_batch(batch("J1", 0, false, w())).await.unwrap();

        assert_eq!(outcomes[0].action, RecordAction::Skipped);
        assert!(!outcomes[0].new_link);
        let links = ledger.list_by_job("J1", true).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].action, RecordAction::Created);
    }

    #[tokio::test]
    async fn test_incremental_update_keeps_previous_payload() {
        let (_temp, store, ledger) = setup();
        store
            .commit_batch(batch("J1", 0, false, vec![write(0, "R1", json!({"title": "old"}))]))
            .await
            .unwrap();
        let outcomes = store
            .commit_batch(batch("J2", 0, true, vec![write(0, "R1", json!({"title": "new"}))]))
            .await
            .unwrap();
        assert_eq!(outcomes[0].action, RecordAction::Updated);

        let link = &ledger.list_by_job("J2", false).unwrap()[0];
        assert!(link.was_update());
        assert_eq!(link.previous_payload, Some(json!({"title": "old"})));

        // 回滚 J2: 还原旧内容
        store
            .rollback_batch(RollbackBatch {
                job_id: "J2".to_string(),
                items: vec![RollbackItem {
                    source_record_id: "R1".to_string(),
                    target_entity_id: link.target_entity_id.clone(),
                    action: RecordAction::Updated,
                    previous_payload: link.previous_payload.clone(),
                }],
            })
            .await
            .unwrap();
        let current = store.find_by_key(&key("R1")).await.unwrap().unwrap();
        assert_eq!(current.payload, json!({"title": "old"}));
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_whole_batch() {
        let (_temp, store, ledger) = setup();
        let result = store
            .commit_batch(batch(
                "J1",
                0,
                false,
                vec![write(0, "R1", json!({"title": "a"})), write(1, "R2", json!("not-an-object"))],
            ))
            .await;

        assert!(matches!(
            result,
            Err(RepositoryError::RecordWriteFailed { index: 1, .. })
        ));
        // 整批未提交
        assert!(store.find_by_key(&key("R1")).await.unwrap().is_none());
        assert_eq!(ledger.count_active("J1").unwrap(), 0);
        assert!(ledger.latest_restore_point("J1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_commit_is_rolled_back() {
        let (_temp, store, ledger) = setup();
        let commit = batch("J1", 0, false, vec![write(0, "R1", json!({"title": "a"}))]);
        assert!(commit.guard.abandon());

        let result = store.commit_batch(commit).await;
        assert!(matches!(result, Err(RepositoryError::Timeout(_))));
        assert!(store.find_by_key(&key("R1")).await.unwrap().is_none());
        assert!(ledger.committed_batches("J1").unwrap().is_empty());
        assert!(ledger.latest_restore_point("J1").unwrap().is_none());
    }

    #[test]
    fn test_commit_guard_is_exclusive() {
        let guard = CommitGuard::new();
        assert!(guard.begin_commit());
        assert!(!guard.abandon());
        assert!(!guard.is_abandoned());

        let other = CommitGuard::new();
        assert!(other.abandon());
        assert!(!other.begin_commit());
        assert!(other.is_abandoned());
    }

    #[tokio::test]
    async fn test_batch_tallies_recorded_per_action() {
        let (_temp, store, ledger) = setup();
        store
            .commit_batch(batch("J1", 0, false, vec![write(0, "R1", json!({"title": "a"}))]))
            .await
            .unwrap();
        store
            .commit_batch(batch(
                "J1",
                1,
                false,
                vec![write(0, "R1", json!({"title": "a"})), write(1, "R2", json!({"title": "b"}))],
            ))
            .await
            .unwrap();

        let counts = ledger.committed_counts("J1").unwrap();
        assert_eq!(counts.imported, 2);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.updated, 0);
        assert_eq!(counts.failed, 0);
    }
}

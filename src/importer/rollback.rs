// ==========================================
// 数据迁移导入引擎 - 还原/回滚管理器
// ==========================================
// 职责: 按导入台账撤销作业写入（删除新建 / 还原更新）
// 顺序: 子实体先于父实体，同类型内按行号倒序，按批次事务化
// 红线: 只读取台账，不重新推导；USED / EXPIRED 还原点不可再用
// 独立修改: 导入时内容哈希 ≠ 当前哈希 → 按策略排除/阻止/覆盖
// ==========================================

use crate::domain::record::{
    ImportedRecord, ModificationPolicy, ModifiedRecordWarning, RollbackResult, RollbackScope,
};
use crate::domain::types::{RecordAction, RestorePointStatus};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::importer_trait::Clock;
use crate::repository::imported_record_repo::ImportedRecordRepository;
use crate::repository::schema_provider::TargetSchemaProvider;
use crate::repository::target_store::{RollbackBatch, RollbackItem, TargetRecordStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub struct RollbackManager {
    store: Arc<dyn TargetRecordStore>,
    ledger: Arc<ImportedRecordRepository>,
    schemas: Arc<dyn TargetSchemaProvider>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    io_timeout: Duration,
}

impl RollbackManager {
    pub fn new(
        store: Arc<dyn TargetRecordStore>,
        ledger: Arc<ImportedRecordRepository>,
        schemas: Arc<dyn TargetSchemaProvider>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            schemas,
            clock,
            batch_size: batch_size.max(1),
            io_timeout,
        }
    }

    /// 回滚作业
    ///
    /// # 参数
    /// - scope: 全部 / 源记录 ID 子集 / 行号区间
    /// - policy: 独立修改记录的处理策略
    ///
    /// # 返回
    /// - Ok(RollbackResult): complete=true 时还原点已标记 USED
    /// - Err(RollbackBlocked): 还原点缺失/已用/过期，或 Block 策略下检测到独立修改（数据未变）
    #[instrument(skip(self, scope), fields(job_id = %job_id, policy = ?policy))]
    pub async fn rollback(
        &self,
        job_id: &str,
        scope: &RollbackScope,
        policy: ModificationPolicy,
    ) -> ImportResult<RollbackResult> {
        let restore_point = self
            .ledger
            .latest_restore_point(job_id)?
            .ok_or_else(|| ImportError::RollbackBlocked(format!("作业 {} 没有还原点", job_id)))?;

        match restore_point.status {
            RestorePointStatus::Active => {}
            other => {
                return Err(ImportError::RollbackBlocked(format!(
                    "还原点 {} 状态为 {}，不可再次使用",
                    restore_point.restore_point_id, other
                )))
            }
        }

        let now = self.clock.now();
        if restore_point.is_expired_at(now) {
            self.ledger
                .set_restore_point_status(&restore_point.restore_point_id, RestorePointStatus::Expired)?;
            return Err(ImportError::RollbackBlocked(format!(
                "还原点 {} 已于 {} 过期",
                restore_point.restore_point_id,
                restore_point.expires_at.to_rfc3339()
            )));
        }

        let selected: Vec<ImportedRecord> = self
            .ledger
            .list_by_job(job_id, false)?
            .into_iter()
            .filter(|r| scope.matches(r))
            .collect();

        let excluded = self.detect_modified(&selected).await?;
        if !excluded.is_empty() {
            match policy {
                ModificationPolicy::Block => {
                    return Err(ImportError::RollbackBlocked(format!(
                        "{} 条记录导入后被独立修改（首条: {}）",
                        excluded.len(),
                        excluded[0].source_record_id
                    )));
                }
                ModificationPolicy::ExcludeAndWarn => {
                    warn!(count = excluded.len(), "已排除导入后被独立修改的记录");
                }
                ModificationPolicy::Override => {
                    warn!(count = excluded.len(), "显式覆盖独立修改，照常回滚");
                }
            }
        }

        let excluded_ids: HashSet<String> = match policy {
            ModificationPolicy::Override => HashSet::new(),
            _ => excluded.iter().map(|w| w.source_record_id.clone()).collect(),
        };
        let mut targets: Vec<&ImportedRecord> = selected
            .iter()
            .filter(|r| !excluded_ids.contains(&r.source_record_id))
            .collect();

        // 子实体（依赖层级深）先于父实体；同层按行号倒序
        let depth = self.dependency_depths(&targets).await?;
        targets.sort_by(|a, b| {
            let da = depth.get(a.entity_type.as_str()).copied().unwrap_or(0);
            let db = depth.get(b.entity_type.as_str()).copied().unwrap_or(0);
            db.cmp(&da).then(b.row_number.cmp(&a.row_number))
        });

        let mut deleted = 0;
        let mut restored = 0;
        for chunk in targets.chunks(self.batch_size) {
            let items: Vec<RollbackItem> = chunk
                .iter()
                .map(|r| RollbackItem {
                    source_record_id: r.source_record_id.clone(),
                    target_entity_id: r.target_entity_id.clone(),
                    action: r.action,
                    previous_payload: r.previous_payload.clone(),
                })
                .collect();

            tokio::time::timeout(
                self.io_timeout,
                self.store.rollback_batch(RollbackBatch {
                    job_id: job_id.to_string(),
                    items,
                }),
            )
            .await
            .map_err(|_| ImportError::Timeout(format!("回滚批次超过 {} ms", self.io_timeout.as_millis())))??;

            for record in chunk {
                match record.action {
                    RecordAction::Created => deleted += 1,
                    RecordAction::Updated => restored += 1,
                    RecordAction::Skipped => {}
                }
            }
        }

        let complete = *scope == RollbackScope::All && excluded_ids.is_empty();
        let restore_point_status = if complete {
            self.ledger
                .set_restore_point_status(&restore_point.restore_point_id, RestorePointStatus::Used)?;
            RestorePointStatus::Used
        } else {
            RestorePointStatus::Active
        };

        info!(
            deleted,
            restored,
            excluded = excluded_ids.len(),
            complete,
            "回滚完成"
        );

        Ok(RollbackResult {
            job_id: job_id.to_string(),
            deleted,
            restored,
            excluded: if excluded_ids.is_empty() { Vec::new() } else { excluded },
            complete,
            restore_point_status,
        })
    }

    /// 比较导入时哈希与当前哈希（跳过的记录不参与）
    async fn detect_modified(&self, records: &[ImportedRecord]) -> ImportResult<Vec<ModifiedRecordWarning>> {
        let mut modified = Vec::new();
        for record in records.iter().filter(|r| r.action != RecordAction::Skipped) {
            let current = tokio::time::timeout(self.io_timeout, self.store.find_by_id(&record.target_entity_id))
                .await
                .map_err(|_| ImportError::Timeout(format!("目标记录查询超过 {} ms", self.io_timeout.as_millis())))??;

            let current_hash = current.map(|c| c.content_hash);
            if current_hash.as_deref() != Some(record.content_hash.as_str()) {
                modified.push(ModifiedRecordWarning {
                    source_record_id: record.source_record_id.clone(),
                    target_entity_id: record.target_entity_id.clone(),
                    row_number: record.row_number,
                    expected_hash: record.content_hash.clone(),
                    current_hash,
                });
            }
        }
        Ok(modified)
    }

    /// 实体类型的依赖深度（无父实体为 0）
    async fn dependency_depths(&self, records: &[&ImportedRecord]) -> ImportResult<HashMap<String, usize>> {
        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        let mut pending: Vec<String> = records.iter().map(|r| r.entity_type.clone()).collect();
        while let Some(entity_type) = pending.pop() {
            if parents.contains_key(&entity_type) {
                continue;
            }
            let depends_on = self
                .schemas
                .schema(&entity_type)
                .await?
                .map(|s| s.depends_on)
                .unwrap_or_default();
            pending.extend(depends_on.iter().cloned());
            parents.insert(entity_type, depends_on);
        }

        let mut depths = HashMap::new();
        for entity_type in parents.keys() {
            let mut visiting = HashSet::new();
            let depth = depth_of(entity_type, &parents, &mut visiting);
            depths.insert(entity_type.clone(), depth);
        }
        Ok(depths)
    }
}

// 环形依赖按已访问截断
fn depth_of(entity_type: &str, parents: &HashMap<String, Vec<String>>, visiting: &mut HashSet<String>) -> usize {
    if !visiting.insert(entity_type.to_string()) {
        return 0;
    }
    let depth = parents
        .get(entity_type)
        .map(|ps| {
            ps.iter()
                .map(|p| depth_of(p, parents, visiting) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    visiting.remove(entity_type);
    depth
}

// ==========================================
// 数据迁移导入引擎 - 记录级模型
// ==========================================
// 职责: 源行 / 转换结果 / 目标记录 / 导入链接 / 还原点 / 回滚请求
// ==========================================

use crate::domain::types::{RecordAction, RestorePointStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ==========================================
// SourceRow - 解析后的源行（保持列顺序）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub row_number: usize,              // 1 起，不含表头
    pub fields: Vec<(String, String)>,  // (列名, 原始值)
}

impl SourceRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.fields.iter().cloned().collect()
    }
}

// ==========================================
// AppliedTransformation - 转换轨迹
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedTransformation {
    pub field: String,
    pub step: String,  // value_map / 规则类型 / coerce / default / unmapped
    pub before: Value,
    pub after: Value,
}

// ==========================================
// TransformFailure - 单字段转换失败（非致命）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformFailure {
    pub field: String,
    pub source_value: String,
    pub message: String,
}

// ==========================================
// TransformedRecord - 转换后的记录
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub row_number: usize,
    pub source: BTreeMap<String, String>,
    pub target: Map<String, Value>,
    pub applied: Vec<AppliedTransformation>,
    pub failures: Vec<TransformFailure>,
}

impl TransformedRecord {
    pub fn failed_field(&self, field: &str) -> bool {
        self.failures.iter().any(|f| f.field == field)
    }
}

// ==========================================
// PreviewRow - 预览输出
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRow {
    pub row_number: usize,
    pub source: BTreeMap<String, String>,
    pub target: Map<String, Value>,
    pub transformations_applied: Vec<AppliedTransformation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum PreviewSelection {
    Sample(usize),
    Rows(Vec<usize>),
}

// ==========================================
// TargetRecord - 目标存储中的实体
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub entity_id: String,
    pub tenant_id: String,
    pub source_system: String,
    pub source_record_id: String,
    pub entity_type: String,
    pub payload: Value,
    pub content_hash: String,
}

/// 目标记录的自然键（幂等唯一性）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub tenant_id: String,
    pub source_system: String,
    pub source_record_id: String,
    pub entity_type: String,
}

// ==========================================
// ImportedRecord - 作业 ↔ 目标实体 链接
// ==========================================
// 执行期间只追加，回滚时只读取不重新推导
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedRecord {
    pub job_id: String,
    pub source_record_id: String,
    pub target_entity_id: String,
    pub entity_type: String,
    pub row_number: usize,
    pub action: RecordAction,
    pub content_hash: String,              // 导入时内容哈希
    pub previous_payload: Option<Value>,   // 增量更新前的内容
    pub previous_hash: Option<String>,
    pub rolled_back: bool,
    pub imported_at: DateTime<Utc>,
}

impl ImportedRecord {
    pub fn was_update(&self) -> bool {
        self.action == RecordAction::Updated
    }
}

// ==========================================
// RestorePoint - 还原点
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePoint {
    pub restore_point_id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub entity_types: Vec<String>,
    pub record_count: usize,
    pub status: RestorePointStatus,
}

impl RestorePoint {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ==========================================
// ImportErrorLog - 执行期记录失败日志
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportErrorLog {
    pub error_id: String,
    pub job_id: String,
    pub batch_index: usize,
    pub row_number: usize,
    pub source_record_id: String,
    pub message: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

// ==========================================
// DryRunRecord - 试运行逐条预览
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunRecord {
    pub row_number: usize,
    pub source_record_id: String,
    pub action: RecordAction,
    pub before: Option<Value>,
    pub after: Value,
}

// ==========================================
// 回滚请求与结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RollbackScope {
    #[default]
    All,
    RecordIds(Vec<String>),                        // 源记录 ID 子集
    RowRange { start: usize, end: usize },         // 行号闭区间
}

impl RollbackScope {
    pub fn matches(&self, record: &ImportedRecord) -> bool {
        match self {
            RollbackScope::All => true,
            RollbackScope::RecordIds(ids) => ids.iter().any(|id| id == &record.source_record_id),
            RollbackScope::RowRange { start, end } => {
                record.row_number >= *start && record.row_number <= *end
            }
        }
    }
}

/// 导入后被独立修改的记录的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModificationPolicy {
    #[default]
    ExcludeAndWarn, // 排除并返回警告列表
    Block,          // 检测到即拒绝整个回滚
    Override,       // 显式覆盖，照常回滚
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedRecordWarning {
    pub source_record_id: String,
    pub target_entity_id: String,
    pub row_number: usize,
    pub expected_hash: String,
    pub current_hash: Option<String>, // None 表示目标记录已被删除
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub job_id: String,
    pub deleted: usize,
    pub restored: usize,
    pub excluded: Vec<ModifiedRecordWarning>,
    pub complete: bool,
    pub restore_point_status: RestorePointStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imported(row: usize, id: &str) -> ImportedRecord {
        ImportedRecord {
            job_id: "job".to_string(),
            source_record_id: id.to_string(),
            target_entity_id: format!("e-{}", id),
            entity_type: "case".to_string(),
            row_number: row,
            action: RecordAction::Created,
            content_hash: "h".to_string(),
            previous_payload: None,
            previous_hash: None,
            rolled_back: false,
            imported_at: Utc::now(),
        }
    }

    #[test]
    fn test_rollback_scope_matching() {
        let rec = imported(5, "R5");
        assert!(RollbackScope::All.matches(&rec));
        assert!(RollbackScope::RecordIds(vec!["R5".to_string()]).matches(&rec));
        assert!(!RollbackScope::RecordIds(vec!["R6".to_string()]).matches(&rec));
        assert!(RollbackScope::RowRange { start: 1, end: 5 }.matches(&rec));
        assert!(!RollbackScope::RowRange { start: 6, end: 9 }.matches(&rec));
    }

    #[test]
    fn test_source_row_lookup() {
        let row = SourceRow {
            row_number: 1,
            fields: vec![("A".to_string(), "1".to_string())],
        };
        assert_eq!(row.get("A"), Some("1"));
        assert_eq!(row.get("B"), None);
    }
}

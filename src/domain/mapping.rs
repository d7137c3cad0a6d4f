// ==========================================
// 数据迁移导入引擎 - 映射领域模型
// ==========================================
// 职责: 列画像 / 字段映射 / 映射模板 / 值映射
// ==========================================

use crate::domain::types::UnmappedFieldAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ==========================================
// ColumnType - 推断的源列类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    Empty,    // 全部为空
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Email,
    Text,
}

// ==========================================
// ColumnProfile - 源列画像
// ==========================================
// 生命周期: 分析完成后不可变，归属于 ImportJob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub position: usize,             // 列序号（0 起）
    pub name: String,                // 列名（已 trim）
    pub inferred_type: ColumnType,   // 推断类型
    pub null_count: usize,           // 空值数
    pub distinct_count: usize,       // 去重值数
    pub distinct_capped: bool,       // 去重计数是否达到上限
    pub sample_values: Vec<String>,  // 样本值（有界）
}

// ==========================================
// SourceSystemGuess - 源系统识别结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSystemGuess {
    pub system: String,   // 识别出的系统标签（未知时为 "custom"）
    pub confidence: f64,  // Jaccard 相似度
}

// ==========================================
// AnalysisResult - 文件分析输出
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub profiles: Vec<ColumnProfile>,
    pub record_count: usize,       // 有效数据行数
    pub parse_error_count: usize,  // 跳过的畸形行数
    pub source_system: SourceSystemGuess,
    pub format: String,            // csv / xlsx
    pub encoding: String,          // 实际使用的编码
}

// ==========================================
// MappingStatus - 单列映射状态
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingStatus {
    AutoAccepted,      // 置信度 ≥ 自动接受阈值
    NeedsConfirmation, // 介于建议阈值与自动接受阈值之间
    Unmapped,          // 低于建议阈值或目标已被占用
    Confirmed,         // 用户确认（重新评分不可修改）
    FromTemplate,      // 模板精确命中
}

impl MappingStatus {
    /// 是否实际参与转换
    pub fn is_mapped(&self) -> bool {
        !matches!(self, MappingStatus::Unmapped)
    }
}

// ==========================================
// ColumnMapping - 源列 → 目标字段
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: String,
    pub target_field: Option<String>,
    pub confidence: f64,                  // 0-1
    pub status: MappingStatus,
    #[serde(default)]
    pub rule_id: Option<String>,          // 引用的转换规则
    #[serde(default)]
    pub unmapped_action: UnmappedFieldAction,
}

impl ColumnMapping {
    pub fn unmapped(source_column: &str) -> Self {
        Self {
            source_column: source_column.to_string(),
            target_field: None,
            confidence: 0.0,
            status: MappingStatus::Unmapped,
            rule_id: None,
            unmapped_action: UnmappedFieldAction::Ignore,
        }
    }

    /// 生效的目标字段（未映射时为 None）
    pub fn effective_target(&self) -> Option<&str> {
        if self.status.is_mapped() {
            self.target_field.as_deref()
        } else {
            None
        }
    }
}

// ==========================================
// FieldMapping - 作业级有序映射
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>, // 目标字段默认值（无映射时使用）
    #[serde(default)]
    pub template: Option<TemplateRef>,     // 生成时引用的模板
}

impl FieldMapping {
    pub fn for_column(&self, column: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.source_column == column)
    }

    pub fn for_target(&self, target: &str) -> Option<&ColumnMapping> {
        self.columns
            .iter()
            .find(|c| c.effective_target() == Some(target))
    }

    /// 目标字段是否已有映射或默认值
    pub fn covers(&self, target: &str) -> bool {
        self.for_target(target).is_some() || self.defaults.contains_key(target)
    }
}

// ==========================================
// TemplateRef - 模板引用（按 id + 版本，不内嵌副本）
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub template_id: String,
    pub version: i64,
}

// ==========================================
// MappingTemplate - 可复用映射模板
// ==========================================
// 不可变值对象: 编辑即产生新版本，作业历史保持稳定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTemplate {
    pub template_id: String,
    pub version: i64,
    pub tenant_id: String,
    pub name: String,
    pub source_system: String,
    pub target_entity_type: String,
    pub entries: Vec<TemplateEntry>,
    pub value_maps: Vec<ValueMap>,
    pub created_at: DateTime<Utc>,
}

impl MappingTemplate {
    pub fn reference(&self) -> TemplateRef {
        TemplateRef {
            template_id: self.template_id.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub source_column: String,
    pub target_field: String,
    #[serde(default)]
    pub rule_id: Option<String>,
}

// ==========================================
// ValueMap - 单字段值映射表
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMap {
    pub target_field: String,
    pub entries: Vec<ValueMapEntry>,
    #[serde(default)]
    pub default_value: Option<Value>, // "其他" 兜底
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMapEntry {
    pub source_value: String,
    pub target_value: Value,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

impl ValueMap {
    /// 查表: 精确匹配优先，其次忽略大小写/首尾空白
    pub fn lookup(&self, source: &str) -> Option<&Value> {
        if let Some(entry) = self.entries.iter().find(|e| e.source_value == source) {
            return Some(&entry.target_value);
        }
        let trimmed = source.trim();
        self.entries
            .iter()
            .find(|e| e.source_value.trim().eq_ignore_ascii_case(trimmed))
            .map(|e| &e.target_value)
    }
}

// ==========================================
// 数据迁移导入引擎 - 导入作业模型
// ==========================================
// 职责: ImportJob 及其选项/计数/进度/报告
// 所有权: 作业只由编排层按阶段转换修改，审计用途永久保留
// ==========================================

use crate::domain::mapping::{AnalysisResult, FieldMapping, TemplateRef, ValueMap};
use crate::domain::record::RestorePoint;
use crate::domain::types::{ErrorHandlingMode, JobState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// JobOptions - 作业选项（创建时指定）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub batch_size: Option<usize>,               // None 使用全局配置
    #[serde(default = "default_error_handling")]
    pub error_handling: ErrorHandlingMode,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub incremental: bool,                       // true: 已存在记录原地更新
    #[serde(default)]
    pub source_key_field: Option<String>,        // 源记录 ID 字段（覆盖模式 key_field）
}

fn default_error_handling() -> ErrorHandlingMode {
    ErrorHandlingMode::SkipAndContinue
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            error_handling: default_error_handling(),
            dry_run: false,
            incremental: false,
            source_key_field: None,
        }
    }
}

// ==========================================
// JobCounts - 记录计数
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub source: usize,   // 源记录数
    pub imported: usize, // 新建
    pub updated: usize,  // 增量更新
    pub skipped: usize,  // 已存在跳过
    pub failed: usize,   // 失败
}

// ==========================================
// ImportJob - 一次迁移运行
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: String,
    pub tenant_id: String,
    pub source_system: String,
    pub target_entity_type: String,
    pub state: JobState,
    pub options: JobOptions,
    pub counts: JobCounts,
    pub blob_key: Option<String>,
    pub encoding_hint: Option<String>,
    pub analysis: Option<AnalysisResult>,
    pub template: Option<TemplateRef>,
    pub failure_reason: Option<String>,
    pub last_committed_batch: Option<usize>, // 可恢复游标
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(
        job_id: String,
        tenant_id: &str,
        source_system: &str,
        target_entity_type: &str,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            tenant_id: tenant_id.to_string(),
            source_system: source_system.to_string(),
            target_entity_type: target_entity_type.to_string(),
            state: JobState::Created,
            options,
            counts: JobCounts::default(),
            blob_key: None,
            encoding_hint: None,
            analysis: None,
            template: None,
            failure_reason: None,
            last_committed_batch: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ==========================================
// ExecuteOptions - 单次执行参数
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub error_handling: Option<ErrorHandlingMode>, // None 使用作业选项
}

// ==========================================
// ImportProgress - 运行中进度快照
// ==========================================
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportProgress {
    pub job_id: String,
    pub state: Option<JobState>,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches_total: usize,
    pub batches_committed: usize,
    pub eta_seconds: Option<u64>,
}

// ==========================================
// JobReport - 作业汇总
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: ImportJob,
    pub mapping: Option<FieldMapping>,
    pub value_maps: Vec<ValueMap>,
    pub validation_errors: usize,
    pub validation_warnings: usize,
    pub validation_infos: usize,
    pub error_digest: Vec<ErrorDigestEntry>,
    pub restore_point: Option<RestorePoint>,
    pub rollback_available: bool,
}

/// 错误摘要（按代码聚合）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDigestEntry {
    pub code: String,
    pub field: Option<String>,
    pub count: usize,
    pub first_row: Option<usize>,
    pub sample_message: String,
}

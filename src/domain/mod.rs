// ==========================================
// 数据迁移导入引擎 - 领域模型层
// ==========================================
// 职责: 定义作业、映射、规则、问题、记录等纯数据类型
// 红线: 不含数据访问逻辑,不含流水线逻辑
// ==========================================

pub mod job;
pub mod mapping;
pub mod record;
pub mod rule;
pub mod schema;
pub mod types;
pub mod validation;

// 重导出核心类型
pub use job::{
    ErrorDigestEntry, ExecuteOptions, ImportJob, ImportProgress, JobCounts, JobOptions, JobReport,
};
pub use mapping::{
    AnalysisResult, ColumnMapping, ColumnProfile, ColumnType, FieldMapping, MappingStatus,
    MappingTemplate, SourceSystemGuess, TemplateEntry, TemplateRef, ValueMap, ValueMapEntry,
};
pub use record::{
    AppliedTransformation, DryRunRecord, ImportErrorLog, ImportedRecord, ModificationPolicy,
    ModifiedRecordWarning, PreviewRow, PreviewSelection, RecordKey, RestorePoint, RollbackResult,
    RollbackScope, SourceRow, TargetRecord, TransformFailure, TransformedRecord,
};
pub use rule::{ConditionalBranch, Predicate, PredicateOp, RuleValue, StringOp, TransformationRule};
pub use schema::{BusinessRule, FieldType, TargetField, TargetSchema};
pub use types::{
    ErrorHandlingMode, IssueCategory, JobState, RecordAction, RestorePointStatus, Severity,
    UnmappedFieldAction,
};
pub use validation::{ValidationIssue, ValidationReport};

// ==========================================
// 数据迁移导入引擎 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod blob_store;
pub mod error;
pub mod imported_record_repo;
pub mod issue_repo;
pub mod job_repo;
pub mod schema_provider;
pub mod target_store;
pub mod template_repo;

// 重导出核心仓储
pub use blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use error::{RepositoryError, RepositoryResult};
pub use imported_record_repo::ImportedRecordRepository;
pub use issue_repo::{ValidationIssueRepository, ValidationRunSummary};
pub use job_repo::{ImportJobRepository, StoredRule};
pub use schema_provider::{StaticSchemaProvider, TargetSchemaProvider};
pub use target_store::{
    content_hash, BatchCommit, CommitGuard, RecordWrite, RollbackBatch, RollbackItem,
    SqliteTargetStore, TargetRecordStore, WriteOutcome,
};
pub use template_repo::MappingTemplateRepository;

use chrono::{DateTime, SecondsFormat, Utc};

/// 统一的时间戳存储格式（定宽 RFC 3339，可按字符串排序）
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> RepositoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::SerializationError(format!("时间戳格式错误 {}: {}", raw, e)))
}

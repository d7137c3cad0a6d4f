// ==========================================
// 数据迁移导入引擎 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型，转换流水线/仓储错误为用户友好的错误消息
// 约束: 每个错误带错误码、行号/字段/源值（适用时）与建议修复，不暴露内部错误链
// ==========================================

use crate::i18n;
use crate::importer::error::ImportError;
use crate::repository::error::RepositoryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 请求错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("作业忙: {0}")]
    JobBusy(String),

    // ==========================================
    // 流水线错误
    // ==========================================
    #[error("文件格式不支持: {0}")]
    UnsupportedFormat(String),

    #[error("文件无数据行: {0}")]
    EmptyInput(String),

    #[error("必填字段未映射: {}", fields.join(", "))]
    MappingIncomplete { fields: Vec<String> },

    #[error("转换失败 (行 {row}, 字段 {field}): {message}")]
    TransformationFailed {
        row: usize,
        field: String,
        value: String,
        message: String,
    },

    #[error("存在 {error_count} 个错误级校验问题，禁止执行")]
    ValidationBlocked { error_count: usize },

    #[error("记录重复 (行 {row}): {source_record_id}")]
    RecordConflict { row: usize, source_record_id: String },

    #[error("批次提交失败 (批次 {batch_index}): {message}")]
    BatchCommitFailed { batch_index: usize, message: String },

    #[error("回滚被阻止: {0}")]
    RollbackBlocked(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据库事务失败: {0}")]
    DatabaseTransactionError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;

/// 面向用户的错误详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub row: Option<usize>,
    pub field: Option<String>,
    pub value: Option<String>,
    pub suggested_fix: Option<String>,
}

impl ApiError {
    /// 错误码（稳定，供调用方分支处理）
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            ApiError::JobBusy(_) => "JOB_BUSY",
            ApiError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            ApiError::EmptyInput(_) => "EMPTY_INPUT",
            ApiError::MappingIncomplete { .. } => "MAPPING_INCOMPLETE",
            ApiError::TransformationFailed { .. } => "TRANSFORMATION_FAILED",
            ApiError::ValidationBlocked { .. } => "VALIDATION_BLOCKED",
            ApiError::RecordConflict { .. } => "RECORD_CONFLICT",
            ApiError::BatchCommitFailed { .. } => "BATCH_COMMIT_FAILED",
            ApiError::RollbackBlocked(_) => "ROLLBACK_BLOCKED",
            ApiError::Timeout(_) => "TIMEOUT",
            ApiError::DatabaseError(_)
            | ApiError::DatabaseConnectionError(_)
            | ApiError::DatabaseTransactionError(_) => "DATABASE_ERROR",
            ApiError::InternalError(_) | ApiError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// 转换为用户可见的错误详情
    pub fn detail(&self) -> ErrorDetail {
        let mut detail = ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
            row: None,
            field: None,
            value: None,
            suggested_fix: None,
        };
        match self {
            ApiError::UnsupportedFormat(_) => {
                detail.suggested_fix = Some(i18n::t("api.fix.unsupported_format"));
            }
            ApiError::EmptyInput(_) => {
                detail.suggested_fix = Some(i18n::t("api.fix.empty_input"));
            }
            ApiError::MappingIncomplete { fields } => {
                detail.field = fields.first().cloned();
                detail.suggested_fix = Some(i18n::t_with_args(
                    "api.fix.mapping_incomplete",
                    &[("fields", fields.join(", ").as_str())],
                ));
            }
            ApiError::TransformationFailed {
                row, field, value, ..
            } => {
                detail.row = Some(*row);
                detail.field = Some(field.clone());
                detail.value = Some(value.clone());
                detail.suggested_fix = Some(i18n::t("fix.transformation_failed"));
            }
            ApiError::ValidationBlocked { error_count } => {
                detail.suggested_fix = Some(i18n::t_with_args(
                    "api.fix.validation_blocked",
                    &[("count", error_count.to_string().as_str())],
                ));
            }
            ApiError::RecordConflict {
                row,
                source_record_id,
            } => {
                detail.row = Some(*row);
                detail.value = Some(source_record_id.clone());
                detail.suggested_fix = Some(i18n::t("api.fix.record_conflict"));
            }
            ApiError::RollbackBlocked(_) => {
                detail.suggested_fix = Some(i18n::t("api.fix.rollback_blocked"));
            }
            ApiError::JobBusy(_) => {
                detail.suggested_fix = Some(i18n::t("api.fix.job_busy"));
            }
            ApiError::Timeout(_) => {
                detail.suggested_fix = Some(i18n::t("api.fix.timeout"));
            }
            _ => {}
        }
        detail
    }
}

// ==========================================
// 从 ImportError 转换
// ==========================================
impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::UnsupportedFormat(msg) => ApiError::UnsupportedFormat(msg),
            ImportError::EmptyInput(msg) => ApiError::EmptyInput(msg),
            ImportError::MappingIncomplete { fields } => ApiError::MappingIncomplete { fields },
            ImportError::TransformationFailed {
                row,
                field,
                value,
                message,
            } => ApiError::TransformationFailed {
                row,
                field,
                value,
                message,
            },
            ImportError::ValidationBlocked { error_count } => {
                ApiError::ValidationBlocked { error_count }
            }
            ImportError::RecordConflict {
                row,
                source_record_id,
            } => ApiError::RecordConflict {
                row,
                source_record_id,
            },
            ImportError::BatchCommitFailed {
                batch_index,
                message,
            } => ApiError::BatchCommitFailed {
                batch_index,
                message,
            },
            ImportError::RollbackBlocked(msg) => ApiError::RollbackBlocked(msg),
            ImportError::JobNotFound(id) => ApiError::NotFound(format!("作业(id={})不存在", id)),
            ImportError::InvalidStateTransition { from, to } => ApiError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
            ImportError::JobBusy(id) => ApiError::JobBusy(id),
            ImportError::Timeout(msg) => ApiError::Timeout(msg),
            ImportError::UnknownEntityType(entity) => {
                ApiError::InvalidInput(format!("目标实体类型未注册: {}", entity))
            }
            ImportError::InvalidArgument(msg) => ApiError::InvalidInput(msg),
            ImportError::Repository(err) => err.into(),
            ImportError::Other(err) => ApiError::Other(err),
        }
    }
}

// ==========================================
// 从 RepositoryError 转换
// 目的: 将Repository层的技术错误转换为用户友好的业务错误
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::DatabaseTransactionError(msg) => {
                ApiError::DatabaseTransactionError(msg)
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::DatabaseError(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::DatabaseError(format!("外键约束违反: {}", msg))
            }
            RepositoryError::RecordWriteFailed { index, message } => ApiError::BatchCommitFailed {
                batch_index: index,
                message,
            },
            RepositoryError::Timeout(msg) => ApiError::Timeout(msg),
            RepositoryError::SerializationError(msg) | RepositoryError::IoError(msg) => {
                ApiError::InternalError(msg)
            }
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::JobState;

    #[test]
    fn test_validation_blocked_detail() {
        let _guard = crate::i18n::LOCALE_TEST_LOCK.lock().unwrap();
        crate::i18n::set_locale("zh-CN");

        let err: ApiError = ImportError::ValidationBlocked { error_count: 12 }.into();
        let detail = err.detail();
        assert_eq!(detail.code, "VALIDATION_BLOCKED");
        assert!(detail.message.contains("12"));
        assert!(detail.suggested_fix.unwrap().contains("12"));
    }

    #[test]
    fn test_transformation_failed_carries_location() {
        let err: ApiError = ImportError::TransformationFailed {
            row: 7,
            field: "report_date".to_string(),
            value: "13/40/2024".to_string(),
            message: "无法按 MM/DD/YYYY 解析".to_string(),
        }
        .into();
        let detail = err.detail();
        assert_eq!(detail.row, Some(7));
        assert_eq!(detail.field.as_deref(), Some("report_date"));
        assert_eq!(detail.value.as_deref(), Some("13/40/2024"));
        assert!(detail.suggested_fix.is_some());
    }

    #[test]
    fn test_state_and_repository_conversion() {
        let err: ApiError = ImportError::InvalidStateTransition {
            from: JobState::Created,
            to: JobState::Importing,
        }
        .into();
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");

        let err: ApiError = ImportError::Repository(RepositoryError::NotFound {
            entity: "ImportJob".to_string(),
            id: "J1".to_string(),
        })
        .into();
        match err {
            ApiError::NotFound(msg) => {
                assert!(msg.contains("ImportJob"));
                assert!(msg.contains("J1"));
            }
            other => panic!("Expected NotFound, got {:?}", other),
        }

        let err: ApiError = RepositoryError::Timeout("commit".to_string()).into();
        assert_eq!(err.detail().code, "TIMEOUT");
    }
}
